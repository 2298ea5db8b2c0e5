//! Writes to the engine's own tables: the change log, record metadata, the
//! key/value meta store and notices.

use crate::error::Result;
use crate::{Change, ChangeId, RecordMeta, Schema, Timestamp};
use rusqlite::{params, Connection};
use tracing::trace;

/// Meta key holding this device's id.
pub const DEVICE_ID: &str = "device_id";
/// Meta key holding the time the last incoming change was processed.
pub const LAST_LOCAL_SYNC: &str = "last_local_sync";
/// Meta key holding the id of the last incoming change processed.
pub const LAST_SYNC: &str = "last_sync";

pub struct Journal<'a> {
    conn: &'a Connection,
    schema: &'a Schema,
}

impl<'a> Journal<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a Schema) -> Self {
        Self { conn, schema }
    }

    /// Append `change` to the log and return the id it was given locally.
    pub fn append_change(&self, change: &Change) -> Result<ChangeId> {
        let sql = format!(
            "INSERT INTO {} (table_name, row_id, operation, data, source, vclock, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            self.schema.changes_table()
        );
        self.conn.execute(
            &sql,
            params![
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
        trace!(id, table = %change.table_name, row_id = %change.row_id, "change logged");
        Ok(id)
    }

    /// Insert or replace the metadata for `meta`'s record.
    pub fn upsert_record_meta(&self, meta: &RecordMeta) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, row_id, mod, source, vclock, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (table_name, row_id) DO UPDATE SET
                 mod = excluded.mod,
                 source = excluded.source,
                 vclock = excluded.vclock,
                 modified = excluded.modified",
            self.schema.record_meta_table()
        );
        self.conn.execute(
            &sql,
            params![
                meta.table_name,
                meta.row_id,
                meta.mod_,
                meta.source,
                meta.vclock,
                meta.modified,
            ],
        )?;
        Ok(())
    }

    pub fn set_meta(&self, name: &str, value: &str) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (meta_name, meta_value) VALUES (?1, ?2)",
            self.schema.meta_table()
        );
        self.conn.execute(&sql, [name, value])?;
        Ok(())
    }

    /// Record that the incoming change `change_id` has been processed.
    pub fn advance_watermark(&self, change_id: ChangeId) -> Result<()> {
        self.set_meta(LAST_LOCAL_SYNC, &Timestamp::now().to_string())?;
        self.set_meta(LAST_SYNC, &change_id.to_string())
    }

    pub fn add_notice(
        &self,
        table: &str,
        row_id: &str,
        message: &str,
        conflict: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (table_name, row_id, message, conflict, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            self.schema.notice_table()
        );
        let conflict = conflict.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            &sql,
            params![table, row_id, message, conflict, Timestamp::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{RecordAccessor, SqliteAccessor};
    use crate::{ChangeFilter, ChangePayload, RowSnapshot, VectorClock};
    use serde_json::json;

    fn setup() -> (Connection, Schema) {
        let conn = Connection::open_in_memory().unwrap();
        let schema = Schema::new("synq");
        schema.migrate(&conn).unwrap();
        (conn, schema)
    }

    fn sample_change() -> Change {
        Change {
            id: 41,
            table_name: "items".into(),
            row_id: "1".into(),
            payload: ChangePayload::Insert(
                RowSnapshot::from_value(json!({"id": "1", "name": "pen"})).unwrap(),
            ),
            vclock: VectorClock::from_entries([("B", 1)]),
            source: "B".into(),
            modified: Timestamp::parse("2024-03-01 10:00:00").unwrap(),
        }
    }

    #[test]
    fn append_change_assigns_local_id() {
        let (conn, schema) = setup();
        let journal = Journal::new(&conn, &schema);
        let change = sample_change();

        assert_eq!(journal.append_change(&change).unwrap(), 1);
        assert_eq!(journal.append_change(&change).unwrap(), 2);

        let logged = SqliteAccessor::new(&conn, &schema)
            .changes(&ChangeFilter::new())
            .unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].id, 1);
        assert_eq!(logged[0].payload, change.payload);
        assert_eq!(logged[0].vclock, change.vclock);
    }

    #[test]
    fn record_meta_upsert_replaces() {
        let (conn, schema) = setup();
        let journal = Journal::new(&conn, &schema);
        let change = sample_change();

        let first = RecordMeta::for_change(&change, VectorClock::from_entries([("B", 1)]), "A");
        journal.upsert_record_meta(&first).unwrap();

        let second = RecordMeta::for_change(
            &change,
            VectorClock::from_entries([("A", 1), ("B", 1)]),
            "A",
        );
        journal.upsert_record_meta(&second).unwrap();

        let meta = SqliteAccessor::new(&conn, &schema)
            .get_record_meta("items", "1")
            .unwrap()
            .unwrap();
        assert_eq!(meta, second);
    }

    #[test]
    fn watermark_and_meta_values() {
        let (conn, schema) = setup();
        let journal = Journal::new(&conn, &schema);
        journal.advance_watermark(17).unwrap();

        let accessor = SqliteAccessor::new(&conn, &schema);
        assert_eq!(accessor.meta_value(LAST_SYNC).unwrap().as_deref(), Some("17"));
        let last = accessor.meta_value(LAST_LOCAL_SYNC).unwrap().unwrap();
        assert!(Timestamp::parse(&last).is_ok());

        journal.set_meta(DEVICE_ID, "dev-1").unwrap();
        journal.set_meta(DEVICE_ID, "dev-2").unwrap();
        assert_eq!(accessor.meta_value(DEVICE_ID).unwrap().as_deref(), Some("dev-2"));
    }

    #[test]
    fn notices_keep_conflict_json() {
        let (conn, schema) = setup();
        let journal = Journal::new(&conn, &schema);
        journal
            .add_notice("items", "1", "resurrected", Some(&json!({"id": 3})))
            .unwrap();
        journal.add_notice("items", "2", "plain", None).unwrap();

        let notices = SqliteAccessor::new(&conn, &schema).notices().unwrap();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].conflict, Some(json!({"id": 3})));
        assert_eq!(notices[1].conflict, None);
    }
}
