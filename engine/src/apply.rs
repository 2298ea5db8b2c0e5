//! Applying incoming changes to the local database.
//!
//! Changes are processed in order, in batches of `batch_size`, each batch
//! inside its own savepoint. Every change passes the [`ChangeGate`] first.
//! Accepted changes are logged, written to the row with capture suppressed and
//! folded into the record's meta. A failure anywhere in a batch rolls back
//! that batch only; the next batch still runs.

use crate::accessor::{RecordAccessor, SqliteAccessor};
use crate::capture::{Capture, RowWriter};
use crate::error::Result;
use crate::gate::{ChangeGate, Checks, Decision, Reason};
use crate::journal::Journal;
use crate::pending::SqlitePendingQueue;
use crate::{Change, ChangeId, ChangePayload, Operation, RecordMeta, RowId, Schema, TableName};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const RESURRECTION_NOTICE: &str = "deleted record restored from its tombstone to apply an update";

/// What happened to one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ChangeStatus {
    Accepted,
    Deferred(Reason),
    Rejected(Reason),
    /// The change's batch was rolled back; nothing it did persists
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub change_id: ChangeId,
    pub table_name: TableName,
    pub row_id: RowId,
    pub status: ChangeStatus,
    pub checks: Checks,
}

impl ChangeOutcome {
    fn new(change: &Change, status: ChangeStatus, checks: Checks) -> Self {
        Self {
            change_id: change.id,
            table_name: change.table_name.clone(),
            row_id: change.row_id.clone(),
            status,
            checks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Committed,
    RolledBack { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Name of the savepoint the batch ran in
    pub savepoint: String,
    pub status: BatchStatus,
    pub outcomes: Vec<ChangeOutcome>,
}

/// Result of one `apply_changes` call, batch by batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub batches: Vec<BatchReport>,
}

impl ApplyReport {
    /// Every change outcome, in submission order.
    pub fn outcomes(&self) -> impl Iterator<Item = &ChangeOutcome> {
        self.batches.iter().flat_map(|batch| batch.outcomes.iter())
    }

    pub fn accepted(&self) -> usize {
        self.count(|status| matches!(status, ChangeStatus::Accepted))
    }

    pub fn deferred(&self) -> usize {
        self.count(|status| matches!(status, ChangeStatus::Deferred(_)))
    }

    pub fn rejected(&self) -> usize {
        self.count(|status| matches!(status, ChangeStatus::Rejected(_)))
    }

    pub fn rolled_back(&self) -> usize {
        self.count(|status| matches!(status, ChangeStatus::RolledBack))
    }

    /// True when no batch was rolled back.
    pub fn is_clean(&self) -> bool {
        self.batches
            .iter()
            .all(|batch| batch.status == BatchStatus::Committed)
    }

    fn count(&self, pred: impl Fn(&ChangeStatus) -> bool) -> usize {
        self.outcomes().filter(|outcome| pred(&outcome.status)).count()
    }
}

/// Hands out savepoint names unique for the lifetime of a store.
#[derive(Debug)]
pub(crate) struct SavepointNames {
    prefix: String,
    next: u64,
}

impl SavepointNames {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 0,
        }
    }

    pub(crate) fn next_name(&mut self) -> String {
        self.next += 1;
        format!("{}_sp_{}", self.prefix, self.next)
    }
}

pub(crate) struct ApplyEngine<'a> {
    pub(crate) conn: &'a mut Connection,
    pub(crate) schema: &'a Schema,
    pub(crate) local_id: &'a str,
    pub(crate) batch_size: usize,
    pub(crate) names: &'a mut SavepointNames,
}

impl ApplyEngine<'_> {
    /// Apply `changes` in order. Only failing to open or close a savepoint
    /// is returned as an error.
    pub(crate) fn run(self, changes: &[Change], restore: bool) -> Result<ApplyReport> {
        let ApplyEngine {
            conn,
            schema,
            local_id,
            batch_size,
            names,
        } = self;
        let mut report = ApplyReport::default();

        for batch in changes.chunks(batch_size.max(1)) {
            let name = names.next_name();
            let savepoint = conn.savepoint_with_name(name.as_str())?;

            let result = batch
                .iter()
                .map(|change| apply_change(&savepoint, schema, local_id, change, restore))
                .collect::<Result<Vec<_>>>();

            let batch_report = match result {
                Ok(outcomes) => {
                    savepoint.commit()?;
                    debug!(savepoint = %name, changes = batch.len(), "batch committed");
                    BatchReport {
                        savepoint: name,
                        status: BatchStatus::Committed,
                        outcomes,
                    }
                }
                Err(err) => {
                    // default drop behaviour: roll back, then release
                    savepoint.finish()?;
                    error!(savepoint = %name, error = %err, "batch rolled back");
                    let outcomes = batch
                        .iter()
                        .map(|change| {
                            ChangeOutcome::new(change, ChangeStatus::RolledBack, Checks::default())
                        })
                        .collect();
                    BatchReport {
                        savepoint: name,
                        status: BatchStatus::RolledBack {
                            error: err.to_string(),
                        },
                        outcomes,
                    }
                }
            };
            report.batches.push(batch_report);
        }

        Ok(report)
    }
}

/// Run one change through the gate and, if accepted, write it.
fn apply_change(
    conn: &Connection,
    schema: &Schema,
    local_id: &str,
    change: &Change,
    restore: bool,
) -> Result<ChangeOutcome> {
    schema.table(&change.table_name)?;

    let accessor = SqliteAccessor::new(conn, schema);
    let pending = SqlitePendingQueue::new(conn, schema);
    let journal = Journal::new(conn, schema);

    let evaluation = ChangeGate::new(&accessor, &pending, local_id).evaluate(change, restore)?;
    let checks = evaluation.checks;

    let vclock = match &evaluation.decision {
        Decision::Accept { vclock } => vclock.clone(),
        Decision::Defer { reason } => {
            journal.advance_watermark(change.id)?;
            return Ok(ChangeOutcome::new(change, ChangeStatus::Deferred(*reason), checks));
        }
        Decision::Reject { reason } => {
            journal.advance_watermark(change.id)?;
            return Ok(ChangeOutcome::new(change, ChangeStatus::Rejected(*reason), checks));
        }
    };

    if evaluation.needs_resurrection(change, restore) && !resurrect(conn, schema, change)? {
        journal.advance_watermark(change.id)?;
        let status = ChangeStatus::Rejected(Reason::NothingToResurrect);
        return Ok(ChangeOutcome::new(change, status, checks));
    }

    journal.append_change(change)?;

    let writer = RowWriter::new(conn, schema, Capture::Suppressed);
    match &change.payload {
        ChangePayload::Insert(row) | ChangePayload::Update(row) => {
            writer.upsert(&change.table_name, &change.row_id, row.clone())?;
        }
        ChangePayload::Delete(_) => {
            writer.delete(&change.table_name, &change.row_id)?;
        }
    }

    journal.advance_watermark(change.id)?;
    journal.upsert_record_meta(&RecordMeta::for_change(change, vclock, local_id))?;

    Ok(ChangeOutcome::new(change, ChangeStatus::Accepted, checks))
}

/// Restore a deleted row from the tombstone of its most recent DELETE.
///
/// Returns `false` when there is no DELETE, or it carried no tombstone.
fn resurrect(conn: &Connection, schema: &Schema, change: &Change) -> Result<bool> {
    let accessor = SqliteAccessor::new(conn, schema);
    let tombstone = accessor
        .get_most_recent_change(&change.table_name, &change.row_id, Some(Operation::Delete))?
        .and_then(|delete| delete.snapshot().cloned());

    let Some(tombstone) = tombstone else {
        warn!(
            change_id = change.id,
            table = %change.table_name,
            row_id = %change.row_id,
            "no tombstone to resurrect from"
        );
        return Ok(false);
    };

    RowWriter::new(conn, schema, Capture::Suppressed).upsert(
        &change.table_name,
        &change.row_id,
        tombstone,
    )?;
    Journal::new(conn, schema).add_notice(
        &change.table_name,
        &change.row_id,
        RESURRECTION_NOTICE,
        Some(&serde_json::to_value(change)?),
    )?;

    info!(
        change_id = change.id,
        table = %change.table_name,
        row_id = %change.row_id,
        "record resurrected"
    );
    Ok(true)
}
