//! Store - the SQLite-backed sync state container.
//!
//! The Store owns the database connection. It sets up the engine's tables,
//! makes local writes that are captured as changes, applies incoming changes
//! and exposes the log and sync state for the transport layer.

use crate::accessor::{RecordAccessor, SqliteAccessor};
use crate::apply::{ApplyEngine, ApplyReport, SavepointNames};
use crate::capture::{Capture, ChangeCapture, RowWriter};
use crate::error::{Error, Result};
use crate::journal::{Journal, DEVICE_ID, LAST_LOCAL_SYNC, LAST_SYNC};
use crate::pending::{PendingQueue, SqlitePendingQueue};
use crate::{
    Change, ChangeFilter, ChangeId, DeviceId, Notice, PendingChange, RecordMeta, RowSnapshot,
    Schema, SyncableTable, SynqConfig, Timestamp,
};
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Configures and opens a [`Store`].
#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    config: SynqConfig,
    tables: Vec<SyncableTable>,
    pre_init: Vec<String>,
    post_init: Vec<String>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SynqConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a user table to sync, identified by `id_column`.
    pub fn table(mut self, name: impl Into<String>, id_column: impl Into<String>) -> Self {
        self.tables.push(SyncableTable::new(name, id_column));
        self
    }

    /// SQL run before the registered tables are checked, typically their DDL.
    pub fn pre_init(mut self, sql: impl Into<String>) -> Self {
        self.pre_init.push(sql.into());
        self
    }

    /// SQL run once setup is complete.
    pub fn post_init(mut self, sql: impl Into<String>) -> Self {
        self.post_init.push(sql.into());
        self
    }

    /// Open a database file, switching it to WAL journaling when configured.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Store> {
        let conn = Connection::open(path)?;
        if self.config.wal {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(journal_mode = %mode, "journal mode set");
        }
        self.build(conn)
    }

    pub fn open_in_memory(self) -> Result<Store> {
        self.build(Connection::open_in_memory()?)
    }

    /// Set up the engine on an already open connection.
    pub fn build(self, conn: Connection) -> Result<Store> {
        let config = self.config.validated()?;

        let mut schema = Schema::new(config.prefix.clone());
        for table in self.tables {
            schema.add_table(table)?;
        }

        for sql in &self.pre_init {
            conn.execute_batch(sql)?;
        }
        schema.migrate(&conn)?;
        schema.describe(&conn)?;

        let device_id = resolve_device_id(&conn, &schema, config.device_id.as_deref())?;

        for sql in &self.post_init {
            conn.execute_batch(sql)?;
        }

        info!(
            prefix = %config.prefix,
            device_id = %device_id,
            tables = schema.tables().count(),
            "store ready"
        );

        Ok(Store {
            conn,
            savepoints: SavepointNames::new(schema.prefix()),
            schema,
            config,
            device_id,
        })
    }
}

/// Configured id, else the persisted one, else a fresh UUID that is then
/// persisted.
fn resolve_device_id(
    conn: &Connection,
    schema: &Schema,
    configured: Option<&str>,
) -> Result<DeviceId> {
    let journal = Journal::new(conn, schema);
    if let Some(id) = configured {
        journal.set_meta(DEVICE_ID, id)?;
        return Ok(id.to_string());
    }

    if let Some(id) = SqliteAccessor::new(conn, schema).meta_value(DEVICE_ID)? {
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    journal.set_meta(DEVICE_ID, &id)?;
    info!(device_id = %id, "generated device id");
    Ok(id)
}

/// The sync engine for one database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    schema: Schema,
    config: SynqConfig,
    device_id: DeviceId,
    savepoints: SavepointNames,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// This device's id, stable across reopens.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &SynqConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The underlying connection, for reads outside the engine.
    ///
    /// Writes to synced tables made here are not captured.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Insert a row and capture it as an INSERT change.
    pub fn insert(&mut self, table: &str, row: Value) -> Result<Change> {
        let snapshot = RowSnapshot::from_value(row)?;
        let id_column = &self.schema.table(table)?.id_column;
        let row_id = snapshot.row_id(id_column).unwrap_or_default();
        self.write_local(table, &row_id, |writer| writer.insert(table, snapshot))
    }

    /// Update the given columns of a row and capture an UPDATE change.
    pub fn update(&mut self, table: &str, row_id: &str, columns: Value) -> Result<Change> {
        let snapshot = RowSnapshot::from_value(columns)?;
        self.write_local(table, row_id, |writer| writer.update(table, row_id, snapshot))
    }

    /// Delete a row and capture a DELETE change carrying its last state.
    pub fn delete(&mut self, table: &str, row_id: &str) -> Result<Change> {
        self.write_local(table, row_id, |writer| writer.delete(table, row_id))
    }

    fn write_local<F>(&mut self, table: &str, row_id: &str, write: F) -> Result<Change>
    where
        F: FnOnce(&RowWriter<'_>) -> Result<Option<Change>>,
    {
        let name = self.savepoints.next_name();
        let savepoint = self.conn.savepoint_with_name(name)?;

        let capture = ChangeCapture::new(&self.schema, &self.device_id);
        let writer = RowWriter::new(&savepoint, &self.schema, Capture::Record(&capture));
        let change = write(&writer)?.ok_or_else(|| Error::NothingCaptured {
            table: table.to_string(),
            row_id: row_id.to_string(),
        })?;

        savepoint.commit()?;
        Ok(change)
    }

    // ========================================================================
    // Incoming changes
    // ========================================================================

    /// Apply changes received from other devices, in the given order.
    pub fn apply_changes(&mut self, changes: &[Change]) -> Result<ApplyReport> {
        self.apply(changes, false)
    }

    /// Re-import a trusted change log, bypassing conflict checks.
    pub fn restore(&mut self, changes: &[Change]) -> Result<ApplyReport> {
        self.apply(changes, true)
    }

    fn apply(&mut self, changes: &[Change], restore: bool) -> Result<ApplyReport> {
        let report = ApplyEngine {
            conn: &mut self.conn,
            schema: &self.schema,
            local_id: &self.device_id,
            batch_size: self.config.batch_size,
            names: &mut self.savepoints,
        }
        .run(changes, restore)?;

        debug!(
            changes = changes.len(),
            batches = report.batches.len(),
            accepted = report.accepted(),
            deferred = report.deferred(),
            rejected = report.rejected(),
            rolled_back = report.rolled_back(),
            restore,
            "changes applied"
        );
        Ok(report)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The current row, or `None` if it does not exist.
    pub fn get_by_id(&self, table: &str, row_id: &str) -> Result<Option<Value>> {
        Ok(self
            .accessor()
            .get_record(table, row_id)?
            .map(RowSnapshot::into_value))
    }

    pub fn record_meta(&self, table: &str, row_id: &str) -> Result<Option<RecordMeta>> {
        self.accessor().get_record_meta(table, row_id)
    }

    /// Changes held back waiting for their prerequisites.
    pub fn pending(&self) -> Result<Vec<PendingChange>> {
        SqlitePendingQueue::new(&self.conn, &self.schema).list()
    }

    /// Drop a pending entry, normally after re-submitting its change.
    pub fn remove_pending(&self, id: i64) -> Result<bool> {
        SqlitePendingQueue::new(&self.conn, &self.schema).remove(id)
    }

    pub fn notices(&self) -> Result<Vec<Notice>> {
        self.accessor().notices()
    }

    /// When incoming changes were last processed.
    pub fn last_local_sync(&self) -> Result<Option<Timestamp>> {
        self.accessor()
            .meta_value(LAST_LOCAL_SYNC)?
            .map(|value| Timestamp::parse(&value))
            .transpose()
    }

    /// Id of the last incoming change processed.
    pub fn last_sync_checkpoint(&self) -> Result<Option<ChangeId>> {
        self.accessor()
            .meta_value(LAST_SYNC)?
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| Error::InvalidChange(format!("bad sync checkpoint {value:?}")))
            })
            .transpose()
    }

    /// The whole change log, oldest first.
    pub fn changes(&self) -> Result<Vec<Change>> {
        self.filtered_changes(&ChangeFilter::new())
    }

    /// Changes modified after the last incoming sync; everything when there
    /// has been none.
    pub fn changes_since_last_sync(&self) -> Result<Vec<Change>> {
        let mut filter = ChangeFilter::new();
        filter.since = self.last_local_sync()?;
        self.filtered_changes(&filter)
    }

    pub fn filtered_changes(&self, filter: &ChangeFilter) -> Result<Vec<Change>> {
        self.accessor().changes(filter)
    }

    fn accessor(&self) -> SqliteAccessor<'_> {
        SqliteAccessor::new(&self.conn, &self.schema)
    }
}
