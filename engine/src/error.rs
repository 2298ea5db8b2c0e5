//! Error types for the TinySynq engine.

use crate::config::ConfigError;
use crate::{RowId, TableName};
use thiserror::Error;

/// All possible errors from the TinySynq engine.
///
/// Policy outcomes (a stale or losing change, a deferral) are not errors;
/// they are reported through [`crate::Decision`] and [`crate::ApplyReport`].
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    // Registration errors
    #[error("table is not registered as syncable: {0}")]
    UnknownTable(TableName),

    #[error("table does not exist in the database: {0}")]
    MissingTable(TableName),

    #[error("unknown column '{column}' for table '{table}'")]
    UnknownColumn { table: TableName, column: String },

    #[error("id column '{column}' of table '{table}' is not a primary key or unique")]
    IdColumnNotUnique { table: TableName, column: String },

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    // Validation errors
    #[error("invalid row snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("{operation} change for {table}/{row_id} has no row snapshot")]
    MissingSnapshot {
        operation: crate::Operation,
        table: TableName,
        row_id: RowId,
    },

    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid operation: {0:?}")]
    InvalidOperation(String),

    #[error("invalid vector clock: {0}")]
    InvalidVectorClock(String),

    #[error("clock counter for '{0}' cannot advance past u64::MAX")]
    ClockOverflow(crate::DeviceId),

    #[error("invalid change: {0}")]
    InvalidChange(String),

    // State errors
    #[error("record not found: {table}/{row_id}")]
    RecordNotFound { table: TableName, row_id: RowId },

    #[error("write to {table}/{row_id} produced no change")]
    NothingCaptured { table: TableName, row_id: RowId },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
