//! Holding area for changes that arrived before their causal prerequisites.
//!
//! Nothing here replays entries; the caller re-submits them as ordinary
//! incoming changes and removes them once they have been dealt with.

use crate::accessor::read_change;
use crate::error::Result;
use crate::{Change, PendingChange, Schema};
use rusqlite::{params, Connection};
use tracing::debug;

pub trait PendingQueue {
    /// Store `change` verbatim, including its own id and vclock.
    fn enqueue(&self, change: &Change) -> Result<i64>;

    /// Every held change, in the order it was queued.
    fn list(&self) -> Result<Vec<PendingChange>>;

    /// Drop one entry. Returns whether it existed.
    fn remove(&self, id: i64) -> Result<bool>;
}

/// `SQLite` implementation of [`PendingQueue`].
pub struct SqlitePendingQueue<'a> {
    conn: &'a Connection,
    schema: &'a Schema,
}

impl<'a> SqlitePendingQueue<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a Schema) -> Self {
        Self { conn, schema }
    }
}

impl PendingQueue for SqlitePendingQueue<'_> {
    fn enqueue(&self, change: &Change) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (change_id, table_name, row_id, operation, data, source, vclock, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            self.schema.pending_table()
        );
        self.conn.execute(
            &sql,
            params![
                change.id,
                change.table_name,
                change.row_id,
                change.operation(),
                change.data_json()?,
                change.source,
                change.vclock,
                change.modified,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(
            pending_id = id,
            change_id = change.id,
            table = %change.table_name,
            row_id = %change.row_id,
            "change queued"
        );
        Ok(id)
    }

    fn list(&self) -> Result<Vec<PendingChange>> {
        // `id` is the change id the entry carried; the queue's own id is
        // read as `pending_id`.
        let sql = format!(
            "SELECT id AS pending_id, change_id AS id,
                    table_name, row_id, operation, data, source, vclock, modified
             FROM {} ORDER BY pending_id ASC",
            self.schema.pending_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>("pending_id")?, read_change(row)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, wire)| {
                Ok(PendingChange {
                    id,
                    change: Change::try_from(wire)?,
                })
            })
            .collect()
    }

    fn remove(&self, id: i64) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.schema.pending_table());
        Ok(self.conn.execute(&sql, [id])? > 0)
    }
}
