//! Read-only lookups the change gate and apply engine rely on.

use crate::error::{Error, Result};
use crate::operation::{WireChange, WireJson};
use crate::sql::{quote, read_snapshot};
use crate::{Change, ChangeFilter, Notice, Operation, RecordMeta, RowSnapshot, Schema};
use rusqlite::{params, Connection, OptionalExtension};

/// Lookups of a record's current row, its sync metadata and its history.
pub trait RecordAccessor {
    /// The row as it currently exists in the user table.
    fn get_record(&self, table: &str, row_id: &str) -> Result<Option<RowSnapshot>>;

    /// Stored sync metadata for the record.
    fn get_record_meta(&self, table: &str, row_id: &str) -> Result<Option<RecordMeta>>;

    /// The most recent logged change for the record, optionally restricted to
    /// one operation.
    fn get_most_recent_change(
        &self,
        table: &str,
        row_id: &str,
        operation: Option<Operation>,
    ) -> Result<Option<Change>>;
}

/// `SQLite` implementation of [`RecordAccessor`], plus the log and notice
/// reads the store exposes.
pub struct SqliteAccessor<'a> {
    conn: &'a Connection,
    schema: &'a Schema,
}

/// Columns read by [`read_change`], in the order the change and pending
/// tables share.
pub(crate) const CHANGE_COLUMNS: &str =
    "id, table_name, row_id, operation, data, source, vclock, modified";

/// Map a change-shaped row to its wire form. Validation happens in
/// `Change::try_from`.
pub(crate) fn read_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<WireChange> {
    Ok(WireChange {
        id: row.get("id")?,
        table_name: row.get("table_name")?,
        row_id: row.get("row_id")?,
        operation: row.get("operation")?,
        data: row.get::<_, Option<String>>("data")?.map(WireJson::Encoded),
        vclock: WireJson::Encoded(row.get("vclock")?),
        source: row.get("source")?,
        modified: row.get("modified")?,
    })
}

impl<'a> SqliteAccessor<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a Schema) -> Self {
        Self { conn, schema }
    }

    /// Read the change log, oldest first.
    pub fn changes(&self, filter: &ChangeFilter) -> Result<Vec<Change>> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM {}
             WHERE (?1 IS NULL OR source != ?1)
               AND (?2 IS NULL OR id > ?2)
               AND (?2 IS NOT NULL OR ?3 IS NULL OR modified > ?3)
             ORDER BY modified ASC, id ASC",
            self.schema.changes_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![filter.exclude, filter.checkpoint, filter.since],
                read_change,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(Change::try_from).collect()
    }

    /// All notices, oldest first.
    pub fn notices(&self) -> Result<Vec<Notice>> {
        let sql = format!(
            "SELECT id, table_name, row_id, message, conflict, created FROM {} ORDER BY id ASC",
            self.schema.notice_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    Notice {
                        id: row.get(0)?,
                        table_name: row.get(1)?,
                        row_id: row.get(2)?,
                        message: row.get(3)?,
                        conflict: None,
                        created: row.get(5)?,
                    },
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(mut notice, conflict)| {
                notice.conflict = conflict.map(|text| serde_json::from_str(&text)).transpose()?;
                Ok(notice)
            })
            .collect()
    }

    /// A value from the key/value meta table.
    pub fn meta_value(&self, name: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT meta_value FROM {} WHERE meta_name = ?1",
            self.schema.meta_table()
        );
        Ok(self
            .conn
            .query_row(&sql, [name], |row| row.get(0))
            .optional()?)
    }
}

impl RecordAccessor for SqliteAccessor<'_> {
    fn get_record(&self, table: &str, row_id: &str) -> Result<Option<RowSnapshot>> {
        let table = self.schema.table(table)?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1",
            quote(&table.name)?,
            quote(&table.id_column)?
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query([row_id])?;
        let snapshot = match rows.next()? {
            Some(row) => Some(read_snapshot(row, &columns)?),
            None => None,
        };
        Ok(snapshot)
    }

    fn get_record_meta(&self, table: &str, row_id: &str) -> Result<Option<RecordMeta>> {
        let sql = format!(
            "SELECT table_name, row_id, mod, source, vclock, modified FROM {}
             WHERE table_name = ?1 AND row_id = ?2",
            self.schema.record_meta_table()
        );
        Ok(self
            .conn
            .query_row(&sql, [table, row_id], |row| {
                Ok(RecordMeta {
                    table_name: row.get(0)?,
                    row_id: row.get(1)?,
                    mod_: row.get(2)?,
                    source: row.get(3)?,
                    vclock: row.get(4)?,
                    modified: row.get(5)?,
                })
            })
            .optional()?)
    }

    fn get_most_recent_change(
        &self,
        table: &str,
        row_id: &str,
        operation: Option<Operation>,
    ) -> Result<Option<Change>> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM {}
             WHERE table_name = ?1 AND row_id = ?2 AND (?3 IS NULL OR operation = ?3)
             ORDER BY modified DESC, id DESC
             LIMIT 1",
            self.schema.changes_table()
        );
        let wire = self
            .conn
            .query_row(&sql, params![table, row_id, operation], read_change)
            .optional()?;

        wire.map(Change::try_from).transpose()
    }
}

/// Fails with [`Error::RecordNotFound`] when the row is absent.
pub fn require_record(
    accessor: &impl RecordAccessor,
    table: &str,
    row_id: &str,
) -> Result<RowSnapshot> {
    accessor
        .get_record(table, row_id)?
        .ok_or_else(|| Error::RecordNotFound {
            table: table.to_string(),
            row_id: row_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SyncableTable, Timestamp, VectorClock};
    use serde_json::json;

    fn setup() -> (Connection, Schema) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT, qty INTEGER);
             INSERT INTO items VALUES ('1', 'pen', 3);",
        )
        .unwrap();
        let mut schema = Schema::new("synq")
            .with_table(SyncableTable::new("items", "id"))
            .unwrap();
        schema.migrate(&conn).unwrap();
        schema.describe(&conn).unwrap();
        (conn, schema)
    }

    fn log_change(conn: &Connection, op: &str, data: Option<&str>, source: &str, modified: &str) {
        conn.execute(
            "INSERT INTO synq_changes (table_name, row_id, operation, data, source, vclock, modified)
             VALUES ('items', '1', ?1, ?2, ?3, '{\"A\":1}', ?4)",
            params![op, data, source, modified],
        )
        .unwrap();
    }

    #[test]
    fn get_record_reads_all_columns() {
        let (conn, schema) = setup();
        let accessor = SqliteAccessor::new(&conn, &schema);

        let row = accessor.get_record("items", "1").unwrap().unwrap();
        assert_eq!(row.into_value(), json!({"id": "1", "name": "pen", "qty": 3}));
        assert!(accessor.get_record("items", "2").unwrap().is_none());
        assert!(matches!(
            accessor.get_record("posts", "1"),
            Err(Error::UnknownTable(_))
        ));
    }

    #[test]
    fn get_record_meta_roundtrip() {
        let (conn, schema) = setup();
        conn.execute(
            "INSERT INTO synq_record_meta (table_name, row_id, mod, source, vclock, modified)
             VALUES ('items', '1', 2, 'A', '{\"A\":2,\"B\":1}', '2024-03-01 10:00:00.000')",
            [],
        )
        .unwrap();
        let accessor = SqliteAccessor::new(&conn, &schema);

        let meta = accessor.get_record_meta("items", "1").unwrap().unwrap();
        assert_eq!(meta.mod_, 2);
        assert_eq!(meta.vclock, VectorClock::from_entries([("A", 2), ("B", 1)]));
        assert_eq!(meta.modified, Timestamp::parse("2024-03-01 10:00:00").unwrap());
        assert!(accessor.get_record_meta("items", "9").unwrap().is_none());
    }

    #[test]
    fn most_recent_change_by_operation() {
        let (conn, schema) = setup();
        log_change(&conn, "INSERT", Some(r#"{"id":"1"}"#), "A", "2024-03-01 10:00:00.000");
        let old = r#"{"id":"1","name":"old"}"#;
        let new = r#"{"id":"1","name":"new"}"#;
        log_change(&conn, "DELETE", Some(old), "A", "2024-03-01 11:00:00.000");
        log_change(&conn, "DELETE", Some(new), "A", "2024-03-01 12:00:00.000");
        log_change(&conn, "UPDATE", Some(r#"{"id":"1"}"#), "A", "2024-03-01 13:00:00.000");
        let accessor = SqliteAccessor::new(&conn, &schema);

        let latest = accessor.get_most_recent_change("items", "1", None).unwrap().unwrap();
        assert_eq!(latest.operation(), Operation::Update);

        let delete = accessor
            .get_most_recent_change("items", "1", Some(Operation::Delete))
            .unwrap()
            .unwrap();
        assert_eq!(delete.snapshot().unwrap().get("name"), Some(&json!("new")));

        assert!(accessor
            .get_most_recent_change("items", "2", None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn filtered_changes() {
        let (conn, schema) = setup();
        log_change(&conn, "INSERT", Some(r#"{"id":"1"}"#), "A", "2024-03-01 10:00:00.000");
        log_change(&conn, "UPDATE", Some(r#"{"id":"1"}"#), "B", "2024-03-01 11:00:00.000");
        log_change(&conn, "UPDATE", Some(r#"{"id":"1"}"#), "A", "2024-03-01 12:00:00.000");
        let accessor = SqliteAccessor::new(&conn, &schema);

        let all = accessor.changes(&ChangeFilter::new()).unwrap();
        assert_eq!(all.iter().map(|c| c.id).collect::<Vec<_>>(), [1, 2, 3]);

        let not_b = accessor.changes(&ChangeFilter::new().exclude("B")).unwrap();
        assert_eq!(not_b.iter().map(|c| c.id).collect::<Vec<_>>(), [1, 3]);

        let since = Timestamp::parse("2024-03-01 10:30:00").unwrap();
        let recent = accessor.changes(&ChangeFilter::new().since(since)).unwrap();
        assert_eq!(recent.iter().map(|c| c.id).collect::<Vec<_>>(), [2, 3]);

        // checkpoint wins over since
        let future = Timestamp::parse("2030-01-01 00:00:00").unwrap();
        let after_first = accessor
            .changes(&ChangeFilter::new().checkpoint(1).since(future))
            .unwrap();
        assert_eq!(after_first.iter().map(|c| c.id).collect::<Vec<_>>(), [2, 3]);
    }

    #[test]
    fn require_record_reports_missing() {
        let (conn, schema) = setup();
        let accessor = SqliteAccessor::new(&conn, &schema);
        assert!(require_record(&accessor, "items", "1").is_ok());
        assert!(matches!(
            require_record(&accessor, "items", "2"),
            Err(Error::RecordNotFound { .. })
        ));
    }
}
