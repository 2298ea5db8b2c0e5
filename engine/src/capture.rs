//! Row writes against the user tables, with explicit change capture.
//!
//! Local writes go through a [`RowWriter`] holding [`Capture::Record`]: after
//! each successful write the [`MutationHook`] turns it into a [`Change`].
//! The apply engine holds [`Capture::Suppressed`], so replayed remote changes
//! never produce new outgoing ones.

use crate::accessor::{require_record, RecordAccessor, SqliteAccessor};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::sql::{quote, SqlValue};
use crate::{Change, ChangePayload, RecordMeta, RowSnapshot, Schema, SyncableTable, Timestamp};
use rusqlite::{params_from_iter, Connection};
use tracing::trace;

/// A completed write to one row.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent<'e> {
    pub table: &'e str,
    pub row_id: &'e str,
    /// Row after the write, or the tombstone for a delete
    pub payload: ChangePayload,
}

/// Called synchronously after every captured write, on the same connection
/// and inside the same savepoint as the write itself.
pub trait MutationHook {
    fn after_write(&self, conn: &Connection, event: MutationEvent<'_>) -> Result<Change>;
}

/// Whether writes made through a [`RowWriter`] are reported to a hook.
#[derive(Clone, Copy)]
pub enum Capture<'h> {
    Record(&'h dyn MutationHook),
    Suppressed,
}

/// The default hook: bumps the local clock entry, updates the record's meta
/// and appends the change to the log.
pub struct ChangeCapture<'a> {
    schema: &'a Schema,
    device_id: &'a str,
}

impl<'a> ChangeCapture<'a> {
    pub const fn new(schema: &'a Schema, device_id: &'a str) -> Self {
        Self { schema, device_id }
    }
}

impl MutationHook for ChangeCapture<'_> {
    fn after_write(&self, conn: &Connection, event: MutationEvent<'_>) -> Result<Change> {
        let previous =
            SqliteAccessor::new(conn, self.schema).get_record_meta(event.table, event.row_id)?;

        let (mut vclock, modified) = match previous {
            Some(meta) => {
                let modified = Timestamp::after(Some(&meta.modified));
                (meta.vclock, modified)
            }
            None => (Default::default(), Timestamp::now()),
        };
        vclock.increment(self.device_id)?;

        let mut change = Change {
            id: 0,
            table_name: event.table.to_string(),
            row_id: event.row_id.to_string(),
            payload: event.payload,
            vclock,
            source: self.device_id.to_string(),
            modified,
        };

        let journal = Journal::new(conn, self.schema);
        journal.upsert_record_meta(&RecordMeta::for_change(
            &change,
            change.vclock.clone(),
            self.device_id,
        ))?;
        change.id = journal.append_change(&change)?;

        trace!(
            id = change.id,
            table = %change.table_name,
            row_id = %change.row_id,
            operation = %change.operation(),
            "local change captured"
        );
        Ok(change)
    }
}

/// Writes rows of registered tables.
///
/// Every method returns the captured change, or `None` when capture is
/// suppressed.
pub struct RowWriter<'w> {
    conn: &'w Connection,
    schema: &'w Schema,
    capture: Capture<'w>,
}

impl<'w> RowWriter<'w> {
    pub fn new(conn: &'w Connection, schema: &'w Schema, capture: Capture<'w>) -> Self {
        Self {
            conn,
            schema,
            capture,
        }
    }

    /// Insert a new row.
    ///
    /// The snapshot must carry the id column unless it is an
    /// `INTEGER PRIMARY KEY`, in which case SQLite assigns it.
    pub fn insert(&self, table: &str, snapshot: RowSnapshot) -> Result<Option<Change>> {
        let table = self.schema.table(table)?;
        table.validate_snapshot(&snapshot)?;
        let row_id = snapshot.row_id(&table.id_column);
        if row_id.is_none() && !table.id_is_rowid() {
            return Err(Error::InvalidSnapshot(format!(
                "insert into '{}' needs a string or number '{}'",
                table.name, table.id_column
            )));
        }

        let columns = quoted_columns(&snapshot)?;
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(&table.name)?,
            columns.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(snapshot.iter().map(|(_, v)| SqlValue(v))))?;

        let row_id = row_id.unwrap_or_else(|| self.conn.last_insert_rowid().to_string());
        self.capture_row(table, &row_id, ChangePayload::Insert)
    }

    /// Update the columns present in `snapshot` on an existing row.
    pub fn update(
        &self,
        table: &str,
        row_id: &str,
        snapshot: RowSnapshot,
    ) -> Result<Option<Change>> {
        let table = self.schema.table(table)?;
        let snapshot = snapshot.with_row_id(&table.id_column, row_id)?;
        table.validate_snapshot(&snapshot)?;

        let values: Vec<_> = snapshot
            .iter()
            .filter(|(column, _)| **column != table.id_column)
            .collect();
        if values.is_empty() {
            return Err(Error::InvalidSnapshot(format!(
                "nothing to update on {}/{row_id}",
                table.name
            )));
        }

        let assignments = values
            .iter()
            .enumerate()
            .map(|(i, (column, _))| Ok(format!("{} = ?{}", quote(column)?, i + 1)))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote(&table.name)?,
            assignments.join(", "),
            quote(&table.id_column)?,
            values.len() + 1
        );
        let row_key = serde_json::Value::String(row_id.to_string());
        let params = values
            .iter()
            .map(|(_, v)| SqlValue(v))
            .chain(std::iter::once(SqlValue(&row_key)));

        if self.conn.execute(&sql, params_from_iter(params))? == 0 {
            return Err(Error::RecordNotFound {
                table: table.name.clone(),
                row_id: row_id.to_string(),
            });
        }

        self.capture_row(table, row_id, ChangePayload::Update)
    }

    /// Insert the row, or overwrite the columns present in `snapshot` when a
    /// row with the same id exists. Captured as an UPDATE.
    pub fn upsert(
        &self,
        table: &str,
        row_id: &str,
        snapshot: RowSnapshot,
    ) -> Result<Option<Change>> {
        let table = self.schema.table(table)?;
        let snapshot = snapshot.with_row_id(&table.id_column, row_id)?;
        table.validate_snapshot(&snapshot)?;

        let columns = quoted_columns(&snapshot)?;
        let id_column = quote(&table.id_column)?;
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|column| **column != id_column)
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT ({id_column}) {on_conflict}",
            quote(&table.name)?,
            columns.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(snapshot.iter().map(|(_, v)| SqlValue(v))))?;

        self.capture_row(table, row_id, ChangePayload::Update)
    }

    /// Delete a row by id.
    ///
    /// With capture on, the row must exist and becomes the change's
    /// tombstone. With capture suppressed a missing row is a no-op.
    pub fn delete(&self, table: &str, row_id: &str) -> Result<Option<Change>> {
        let table = self.schema.table(table)?;
        let tombstone = match self.capture {
            Capture::Record(_) => Some(require_record(
                &SqliteAccessor::new(self.conn, self.schema),
                &table.name,
                row_id,
            )?),
            Capture::Suppressed => None,
        };

        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote(&table.name)?,
            quote(&table.id_column)?
        );
        self.conn.execute(&sql, [row_id])?;

        match (self.capture, tombstone) {
            (Capture::Record(hook), Some(row)) => {
                let event = MutationEvent {
                    table: &table.name,
                    row_id,
                    payload: ChangePayload::Delete(Some(row)),
                };
                hook.after_write(self.conn, event).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Read the row back after a write and hand it to the hook.
    fn capture_row(
        &self,
        table: &SyncableTable,
        row_id: &str,
        payload: fn(RowSnapshot) -> ChangePayload,
    ) -> Result<Option<Change>> {
        let Capture::Record(hook) = self.capture else {
            return Ok(None);
        };
        let accessor = SqliteAccessor::new(self.conn, self.schema);
        let row = require_record(&accessor, &table.name, row_id)?;
        let event = MutationEvent {
            table: &table.name,
            row_id,
            payload: payload(row),
        };
        hook.after_write(self.conn, event).map(Some)
    }
}

fn quoted_columns(snapshot: &RowSnapshot) -> Result<Vec<String>> {
    snapshot.columns().map(|column| quote(column)).collect()
}
