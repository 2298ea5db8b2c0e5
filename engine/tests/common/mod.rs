//! Shared helpers for the integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use tinysynq_engine::{Change, Store, SynqConfig};

pub const ITEMS_DDL: &str =
    "CREATE TABLE IF NOT EXISTS items (id TEXT PRIMARY KEY, name TEXT, qty INTEGER, note TEXT)";

/// Install a test-friendly subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// An in-memory store for `device` syncing the `items` table.
pub fn device(device: &str) -> Store {
    init_tracing();
    Store::builder()
        .config(SynqConfig::default().with_device_id(device))
        .pre_init(ITEMS_DDL)
        .table("items", "id")
        .open_in_memory()
        .expect("open store")
}

/// Build a change the way a peer would send it.
pub fn wire_change(
    id: i64,
    operation: &str,
    row_id: &str,
    data: Option<Value>,
    vclock: Value,
    source: &str,
    modified: &str,
) -> Change {
    let mut wire = json!({
        "id": id,
        "table_name": "items",
        "row_id": row_id,
        "operation": operation,
        "vclock": vclock,
        "source": source,
        "modified": modified,
    });
    if let Some(data) = data {
        wire["data"] = data;
    }
    serde_json::from_value(wire).expect("valid change")
}

/// Everything `from` has in its log that did not come from `to`.
pub fn outgoing(from: &Store, to: &Store) -> Vec<Change> {
    from.filtered_changes(&tinysynq_engine::ChangeFilter::new().exclude(to.device_id()))
        .expect("read changes")
}
