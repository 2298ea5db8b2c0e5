//! The change gate: decides, for one incoming change, whether it is applied
//! now, held back, or turned away.
//!
//! Rules, first match wins:
//!
//! 1. restore mode: accept with the merged clock
//! 2. row and meta both absent, not an INSERT: defer ("update before insert").
//!    A missing row that still has meta carries on; an UPDATE to it is later
//!    routed to resurrection.
//! 3. a third-party clock entry drifts by more than one: defer
//! 4. the clocks are concurrent: INSERT wins, otherwise the strictly newer
//!    `modified` wins, otherwise reject ("concurrent writes")
//! 5. the local copy is at least as new: reject ("stale")
//! 6. accept with the merged clock
//!
//! Deferred changes are written to the pending queue as a side effect.

use crate::accessor::RecordAccessor;
use crate::error::Result;
use crate::pending::PendingQueue;
use crate::{Change, ClockComparison, Operation, RecordMeta, RowSnapshot, VectorClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Why a change was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    UpdateBeforeInsert,
    OutOfOrder,
    ConcurrentWrites,
    Stale,
    NothingToResurrect,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reason::UpdateBeforeInsert => "update before insert",
            Reason::OutOfOrder => "received out of order",
            Reason::ConcurrentWrites => "concurrent writes",
            Reason::Stale => "stale",
            Reason::NothingToResurrect => "nothing to resurrect",
        })
    }
}

/// Outcome of the gate for one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Apply the change; `vclock` is what the record's meta becomes.
    Accept { vclock: VectorClock },
    /// Queued as pending; the row is untouched.
    Defer { reason: Reason },
    /// Dropped; the row is untouched.
    Reject { reason: Reason },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accept { .. })
    }

    pub fn reason(&self) -> Option<Reason> {
        match self {
            Decision::Accept { .. } => None,
            Decision::Defer { reason } | Decision::Reject { reason } => Some(*reason),
        }
    }
}

/// Which classification checks fired. Checks that were never reached stay
/// `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checks {
    pub stale: bool,
    pub displaced: bool,
    pub conflicted: bool,
}

/// The decision plus the state it was based on.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub checks: Checks,
    pub record: Option<RowSnapshot>,
    pub meta: Option<RecordMeta>,
}

impl Evaluation {
    /// An UPDATE aimed at a deleted row that still has meta must have the row
    /// restored from its tombstone first.
    pub fn needs_resurrection(&self, change: &Change, restore: bool) -> bool {
        !restore
            && self.record.is_none()
            && self.meta.is_some()
            && change.operation() == Operation::Update
    }
}

pub struct ChangeGate<'g, A, Q> {
    accessor: &'g A,
    pending: &'g Q,
    local_id: &'g str,
}

impl<'g, A: RecordAccessor, Q: PendingQueue> ChangeGate<'g, A, Q> {
    pub fn new(accessor: &'g A, pending: &'g Q, local_id: &'g str) -> Self {
        Self {
            accessor,
            pending,
            local_id,
        }
    }

    /// Classify `change` against the local state of its record.
    pub fn evaluate(&self, change: &Change, restore: bool) -> Result<Evaluation> {
        let record = self
            .accessor
            .get_record(&change.table_name, &change.row_id)?;
        let meta = self
            .accessor
            .get_record_meta(&change.table_name, &change.row_id)?;

        let mut checks = Checks::default();
        let decision = self.decide(change, restore, record.is_some(), meta.as_ref(), &mut checks)?;

        match &decision {
            Decision::Reject {
                reason: Reason::ConcurrentWrites,
            } => warn!(
                change_id = change.id,
                table = %change.table_name,
                row_id = %change.row_id,
                "concurrent write lost to local copy"
            ),
            _ => debug!(
                change_id = change.id,
                table = %change.table_name,
                row_id = %change.row_id,
                ?decision,
                conflicted = checks.conflicted,
                displaced = checks.displaced,
                stale = checks.stale,
                "change evaluated"
            ),
        }

        Ok(Evaluation {
            decision,
            checks,
            record,
            meta,
        })
    }

    fn decide(
        &self,
        change: &Change,
        restore: bool,
        record_exists: bool,
        meta: Option<&RecordMeta>,
        checks: &mut Checks,
    ) -> Result<Decision> {
        let empty = VectorClock::new();
        let local = meta.map_or(&empty, |m| &m.vclock);
        let comparison = ClockComparison::new(
            local,
            &change.vclock,
            self.local_id,
            meta.map(|m| m.modified),
            change.modified,
        );
        let operation = change.operation();

        if restore {
            return Ok(Decision::Accept {
                vclock: comparison.merge(),
            });
        }

        if !record_exists && meta.is_none() && operation != Operation::Insert {
            self.pending.enqueue(change)?;
            return Ok(Decision::Defer {
                reason: Reason::UpdateBeforeInsert,
            });
        }

        checks.displaced = comparison.is_out_of_order();
        if checks.displaced {
            self.pending.enqueue(change)?;
            return Ok(Decision::Defer {
                reason: Reason::OutOfOrder,
            });
        }

        checks.conflicted = comparison.is_conflicted();
        if checks.conflicted {
            let remote_is_newer = meta.map_or(true, |m| change.modified > m.modified);
            return Ok(if operation == Operation::Insert || remote_is_newer {
                Decision::Accept {
                    vclock: comparison.merge(),
                }
            } else {
                Decision::Reject {
                    reason: Reason::ConcurrentWrites,
                }
            });
        }

        checks.stale = comparison.is_out_dated();
        if checks.stale {
            return Ok(Decision::Reject {
                reason: Reason::Stale,
            });
        }

        Ok(Decision::Accept {
            vclock: comparison.merge(),
        })
    }
}
