//! Conversions between JSON row snapshots and SQLite values, plus identifier
//! handling for the dynamically built statements.

use crate::error::{Error, Result};
use crate::RowSnapshot;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue, ValueRef};
use serde_json::{Number, Value};

/// Whether `name` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Double-quote an identifier, rejecting anything that is not plain.
pub fn quote(name: &str) -> Result<String> {
    if is_identifier(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// Binds a JSON value as the closest SQLite storage class.
///
/// Booleans become 0/1, arrays and objects are stored as JSON text.
#[derive(Debug, Clone, Copy)]
pub struct SqlValue<'a>(pub &'a Value);

impl ToSql for SqlValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => ToSqlOutput::Owned(SqliteValue::Integer(i)),
                (None, Some(f)) => ToSqlOutput::Owned(SqliteValue::Real(f)),
                (None, None) => ToSqlOutput::Owned(SqliteValue::Text(n.to_string())),
            },
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            nested => ToSqlOutput::Owned(SqliteValue::Text(nested.to_string())),
        })
    }
}

/// Read a SQLite value back as JSON.
///
/// Blobs have no JSON form and are refused, as is TEXT that is not UTF-8.
pub fn value_from_sql(column: &str, value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_owned()),
            Err(err) => {
                return Err(Error::InvalidSnapshot(format!(
                    "column '{column}' holds text that is not UTF-8: {err}"
                )))
            }
        },
        ValueRef::Blob(_) => {
            return Err(Error::InvalidSnapshot(format!(
                "column '{column}' holds a BLOB, which cannot be synced"
            )))
        }
    })
}

/// Read every column of `row` into a snapshot.
pub fn read_snapshot(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<RowSnapshot> {
    let mut snapshot = RowSnapshot::new();
    for (idx, name) in columns.iter().enumerate() {
        snapshot.insert(name.clone(), value_from_sql(name, row.get_ref(idx)?)?);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn identifiers() {
        assert!(is_identifier("items"));
        assert!(is_identifier("_synq_changes2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2items"));
        assert!(!is_identifier("items; DROP TABLE x"));
        assert!(!is_identifier("it\"ems"));

        assert_eq!(quote("items").unwrap(), "\"items\"");
        assert!(matches!(quote("a b"), Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn values_survive_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        let inputs = [
            (json!(null), json!(null)),
            (json!(true), json!(1)),
            (json!(42), json!(42)),
            (json!(-1.5), json!(-1.5)),
            (json!("héllo"), json!("héllo")),
            (json!({"a": [1, 2]}), json!("{\"a\":[1,2]}")),
        ];

        for (input, expected) in inputs {
            let got = conn
                .query_row("SELECT ?1", [SqlValue(&input)], |row| {
                    Ok(value_from_sql("v", row.get_ref(0)?))
                })
                .unwrap()
                .unwrap();
            assert_eq!(got, expected, "{input}");
        }
    }

    #[test]
    fn blobs_and_broken_text_are_refused() {
        let conn = Connection::open_in_memory().unwrap();
        let read = |sql: &str| {
            conn.query_row(sql, [], |row| Ok(value_from_sql("body", row.get_ref(0)?)))
                .unwrap()
        };

        match read("SELECT x'0102ff'") {
            Err(Error::InvalidSnapshot(msg)) => assert!(msg.contains("BLOB"), "{msg}"),
            other => panic!("expected a refused blob, got {other:?}"),
        }
        match read("SELECT CAST(x'ff' AS TEXT)") {
            Err(Error::InvalidSnapshot(msg)) => assert!(msg.contains("UTF-8"), "{msg}"),
            other => panic!("expected refused text, got {other:?}"),
        }
    }

    #[test]
    fn reads_named_snapshot() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = vec!["id".to_string(), "name".to_string()];
        let mut stmt = conn.prepare("SELECT 1, 'pen'").unwrap();
        let mut rows = stmt.query([]).unwrap();
        let snapshot = read_snapshot(rows.next().unwrap().unwrap(), &columns).unwrap();
        assert_eq!(snapshot.into_value(), json!({"id": 1, "name": "pen"}));
    }
}
