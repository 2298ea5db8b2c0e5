//! Per-record sync state and the other rows the engine keeps about records.

use crate::{Change, ChangeId, DeviceId, RowId, TableName, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};

/// Sync metadata for one `(table_name, row_id)`.
///
/// Outlives the data row: after a DELETE the meta row stays behind as the
/// marker that the record once existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub table_name: TableName,
    pub row_id: RowId,
    /// The local device's counter in `vclock` when this was written
    #[serde(rename = "mod")]
    pub mod_: u64,
    /// Device whose change was last applied
    pub source: DeviceId,
    pub vclock: VectorClock,
    /// Timestamp of the last applied change
    pub modified: Timestamp,
}

impl RecordMeta {
    /// Metadata after applying `change` with the resolved `vclock`.
    pub fn for_change(change: &Change, vclock: VectorClock, local_id: &str) -> Self {
        Self {
            table_name: change.table_name.clone(),
            row_id: change.row_id.clone(),
            mod_: vclock.get(local_id),
            source: change.source.clone(),
            vclock,
            modified: change.modified,
        }
    }
}

/// A change held back until its causal prerequisites have been seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Position in the pending queue
    pub id: i64,
    /// The change exactly as it was received; `change.id` is the id it carried
    pub change: Change,
}

/// An informational message about something the engine did on its own,
/// such as resurrecting a deleted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub id: i64,
    pub table_name: TableName,
    pub row_id: RowId,
    pub message: String,
    /// The change that prompted the notice, when there was one
    pub conflict: Option<serde_json::Value>,
    pub created: Timestamp,
}

/// Filter for reading the change log.
///
/// `checkpoint` takes precedence over `since` when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    /// Skip changes whose `source` is this device
    pub exclude: Option<DeviceId>,
    /// Only changes with a log id greater than this
    pub checkpoint: Option<ChangeId>,
    /// Only changes modified strictly after this
    pub since: Option<Timestamp>,
}

impl ChangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(mut self, source: impl Into<DeviceId>) -> Self {
        self.exclude = Some(source.into());
        self
    }

    pub fn checkpoint(mut self, id: ChangeId) -> Self {
        self.checkpoint = Some(id);
        self
    }

    pub fn since(mut self, time: Timestamp) -> Self {
        self.since = Some(time);
        self
    }
}
