//! # TinySynq Engine
//!
//! The sync core of a local-first SQLite application.
//!
//! Every device keeps its own copy of the synced tables. Local writes are
//! captured as [`Change`]s; changes from other devices are applied in batches
//! after a conflict check. Nothing here talks to the network: the host moves
//! changes between devices however it likes.
//!
//! ## Core Concepts
//!
//! ### Changes
//!
//! A [`Change`] records one INSERT, UPDATE or DELETE of one row, with:
//! - the producing device (`source`) and its log sequence number (`id`)
//! - a full-row snapshot (the tombstone, for a DELETE)
//! - a [`VectorClock`] giving the producer's causal view of the row
//! - a wall-clock [`Timestamp`], used only to break ties
//!
//! ### Record metadata
//!
//! For each synced row the store keeps a [`RecordMeta`] with the merged
//! vector clock and the time of the last applied write. It survives a DELETE,
//! so a late UPDATE to a deleted row can bring the row back from its
//! tombstone.
//!
//! ### The change gate
//!
//! [`ChangeGate`] classifies each incoming change against that metadata:
//! accept it, defer it to the pending queue (its prerequisites have not
//! arrived), or reject it (stale, or it lost a concurrent write to the local
//! copy). See the [`gate`] module for the exact rules.
//!
//! ### Applying
//!
//! [`Store::apply_changes`] runs changes through the gate in batches, one
//! savepoint per batch, and returns an [`ApplyReport`] with the outcome of
//! every change. A failing batch is rolled back on its own.
//!
//! ## Quick Start
//!
//! ```rust
//! use tinysynq_engine::{Change, ChangeFilter, Store, SynqConfig};
//! use serde_json::json;
//!
//! // 1. Open a store on each device
//! let mut laptop = Store::builder()
//!     .config(SynqConfig::default().with_device_id("laptop"))
//!     .pre_init("CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT)")
//!     .table("items", "id")
//!     .open_in_memory()
//!     .unwrap();
//! let mut phone = Store::builder()
//!     .config(SynqConfig::default().with_device_id("phone"))
//!     .pre_init("CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT)")
//!     .table("items", "id")
//!     .open_in_memory()
//!     .unwrap();
//!
//! // 2. Write locally; the write is captured as a change
//! laptop.insert("items", json!({"id": "1", "name": "pen"})).unwrap();
//!
//! // 3. Ship the laptop's changes to the phone
//! let outgoing: Vec<Change> = laptop
//!     .filtered_changes(&ChangeFilter::new().exclude("phone"))
//!     .unwrap();
//! let report = phone.apply_changes(&outgoing).unwrap();
//! assert_eq!(report.accepted(), 1);
//!
//! // 4. Read the synced row
//! let row = phone.get_by_id("items", "1").unwrap().unwrap();
//! assert_eq!(row["name"], "pen");
//! ```
//!
//! ## Configuration
//!
//! [`SynqConfig`] holds the table prefix, batch size, WAL switch and an
//! optional fixed device id. It can be read from `TINYSYNQ_*` environment
//! variables with [`SynqConfig::from_env`].
//!
//! ## Logging
//!
//! The engine logs through [`tracing`]. Install a subscriber in the host to
//! see its output.

pub mod accessor;
pub mod apply;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod journal;
pub mod operation;
pub mod pending;
pub mod record;
pub mod schema;
pub mod sql;
pub mod store;
pub mod timestamp;

// Re-export main types at crate root
pub use accessor::{RecordAccessor, SqliteAccessor};
pub use apply::{ApplyReport, BatchReport, BatchStatus, ChangeOutcome, ChangeStatus};
pub use capture::{Capture, ChangeCapture, MutationEvent, MutationHook, RowWriter};
pub use clock::{ClockComparison, VectorClock};
pub use config::{ConfigError, SynqConfig};
pub use error::{Error, Result};
pub use gate::{ChangeGate, Checks, Decision, Evaluation, Reason};
pub use operation::{Change, ChangePayload, Operation, RowSnapshot, WireChange, WireJson};
pub use pending::{PendingQueue, SqlitePendingQueue};
pub use record::{ChangeFilter, Notice, PendingChange, RecordMeta};
pub use schema::{Schema, SyncableTable};
pub use store::{Store, StoreBuilder};
pub use timestamp::Timestamp;

/// Type aliases for clarity
pub type TableName = String;
pub type RowId = String;
pub type DeviceId = String;
pub type ChangeId = i64;
