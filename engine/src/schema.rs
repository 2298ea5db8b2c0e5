//! Schema: which user tables are synced, and the engine's own tables.
//!
//! User tables are registered as [`SyncableTable`]s and checked against the
//! database at setup. Every internal table name carries the configured prefix.

use crate::error::{Error, Result};
use crate::sql::{is_identifier, quote};
use crate::{RowSnapshot, TableName};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user table whose rows are synchronised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableTable {
    /// Table name
    pub name: TableName,
    /// Column holding the row identifier
    pub id_column: String,
    /// Columns discovered at setup; empty until then
    #[serde(default)]
    columns: Vec<String>,
    /// The id column is an `INTEGER PRIMARY KEY`, so SQLite assigns it
    #[serde(default)]
    rowid_alias: bool,
}

impl SyncableTable {
    pub fn new(name: impl Into<TableName>, id_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_column: id_column.into(),
            columns: Vec::new(),
            rowid_alias: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether inserts may leave the id to SQLite.
    pub fn id_is_rowid(&self) -> bool {
        self.rowid_alias
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Check that every column in `snapshot` exists on this table.
    pub fn validate_snapshot(&self, snapshot: &RowSnapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Err(Error::InvalidSnapshot(format!(
                "empty snapshot for table '{}'",
                self.name
            )));
        }
        if let Some(column) = snapshot.columns().find(|c| !self.has_column(c)) {
            return Err(Error::UnknownColumn {
                table: self.name.clone(),
                column: column.clone(),
            });
        }
        Ok(())
    }

    /// Load the column list from the database.
    fn describe(&mut self, conn: &Connection) -> Result<()> {
        let sql = format!("PRAGMA table_info({})", quote(&self.name)?);
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>("name"))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if columns.is_empty() {
            return Err(Error::MissingTable(self.name.clone()));
        }
        self.columns = columns;

        if !self.has_column(&self.id_column) {
            return Err(Error::UnknownColumn {
                table: self.name.clone(),
                column: self.id_column.clone(),
            });
        }
        if !self.id_is_unique(conn)? {
            return Err(Error::IdColumnNotUnique {
                table: self.name.clone(),
                column: self.id_column.clone(),
            });
        }
        Ok(())
    }

    /// The id column is the sole primary key, or alone in a unique index.
    /// Upserts need it as their conflict target.
    fn id_is_unique(&mut self, conn: &Connection) -> Result<bool> {
        let primary_key: Vec<(String, String)> = conn
            .prepare("SELECT name, type FROM pragma_table_info(?1) WHERE pk > 0")?
            .query_map([&self.name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        if let [(column, declared)] = primary_key.as_slice() {
            if *column == self.id_column {
                self.rowid_alias =
                    declared.eq_ignore_ascii_case("INTEGER") && self.has_rowid(conn)?;
                return Ok(true);
            }
        }

        let unique_indexes: i64 = conn.query_row(
            "SELECT count(*) FROM pragma_index_list(?1) AS il
             WHERE il.\"unique\" = 1
               AND (SELECT count(*) FROM pragma_index_info(il.name)) = 1
               AND (SELECT name FROM pragma_index_info(il.name)) = ?2",
            [&self.name, &self.id_column],
            |row| row.get(0),
        )?;
        Ok(unique_indexes > 0)
    }

    fn has_rowid(&self, conn: &Connection) -> Result<bool> {
        let without_rowid: Option<i64> = conn
            .query_row(
                "SELECT wr FROM pragma_table_list WHERE name = ?1",
                [&self.name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(without_rowid == Some(0))
    }
}

/// Prefix for the internal tables plus the registered syncable tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    prefix: String,
    tables: BTreeMap<TableName, SyncableTable>,
}

impl Schema {
    /// `prefix` must already be sanitised (see [`crate::SynqConfig`]).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a syncable table.
    pub fn add_table(&mut self, table: SyncableTable) -> Result<&mut Self> {
        for ident in [&table.name, &table.id_column] {
            if !is_identifier(ident) {
                return Err(Error::InvalidIdentifier(ident.clone()));
            }
        }
        self.tables.insert(table.name.clone(), table);
        Ok(self)
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: SyncableTable) -> Result<Self> {
        self.add_table(table)?;
        Ok(self)
    }

    /// Look up a registered table.
    pub fn table(&self, name: &str) -> Result<&SyncableTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &SyncableTable> {
        self.tables.values()
    }

    pub fn changes_table(&self) -> String {
        format!("{}_changes", self.prefix)
    }

    pub fn pending_table(&self) -> String {
        format!("{}_pending", self.prefix)
    }

    pub fn record_meta_table(&self) -> String {
        format!("{}_record_meta", self.prefix)
    }

    pub fn meta_table(&self) -> String {
        format!("{}_meta", self.prefix)
    }

    pub fn notice_table(&self) -> String {
        format!("{}_notice", self.prefix)
    }

    /// Create the internal tables and indexes if they do not exist yet.
    pub fn migrate(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.migrations())?;
        Ok(())
    }

    /// Resolve every registered table's columns against the database.
    pub fn describe(&mut self, conn: &Connection) -> Result<()> {
        for table in self.tables.values_mut() {
            table.describe(conn)?;
        }
        Ok(())
    }

    fn migrations(&self) -> String {
        let p = &self.prefix;
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {p}_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                data TEXT,
                source TEXT NOT NULL,
                vclock TEXT NOT NULL,
                modified TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {p}_change_modified_idx ON {p}_changes(modified);
            CREATE INDEX IF NOT EXISTS {p}_change_table_row_idx ON {p}_changes(table_name, row_id);

            CREATE TABLE IF NOT EXISTS {p}_pending (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                change_id INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                data TEXT,
                source TEXT NOT NULL,
                vclock TEXT NOT NULL,
                modified TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {p}_pending_table_row_idx ON {p}_pending(table_name, row_id);

            CREATE TABLE IF NOT EXISTS {p}_record_meta (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                mod INTEGER NOT NULL,
                source TEXT NOT NULL,
                vclock TEXT NOT NULL,
                modified TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {p}_record_meta_idx ON {p}_record_meta(table_name, row_id);
            CREATE INDEX IF NOT EXISTS {p}_record_meta_source_idx ON {p}_record_meta(source);
            CREATE INDEX IF NOT EXISTS {p}_record_meta_modified_idx ON {p}_record_meta(modified);

            CREATE TABLE IF NOT EXISTS {p}_meta (
                meta_name TEXT NOT NULL PRIMARY KEY,
                meta_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {p}_notice (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                message TEXT NOT NULL,
                conflict TEXT,
                created TEXT NOT NULL
            );
            "#
        )
    }
}
