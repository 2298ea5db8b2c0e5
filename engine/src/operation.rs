//! Change types: what happened to which row, and who says so.
//!
//! A [`Change`] is immutable once created. Its payload is a tagged union keyed
//! by [`Operation`], so an INSERT or UPDATE without a row snapshot cannot be
//! represented. Peers exchange the looser [`WireChange`] shape; converting it
//! into a `Change` is the validation boundary.

use crate::error::{Error, Result};
use crate::{ChangeId, DeviceId, RowId, TableName, Timestamp, VectorClock};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The kind of mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(Error::InvalidOperation(other.to_string())),
        }
    }
}

impl ToSql for Operation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Operation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: Error| FromSqlError::Other(Box::new(err)))
    }
}

/// A full-row snapshot: column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowSnapshot(Map<String, Value>);

impl RowSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts only JSON objects.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidSnapshot(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(column.into(), value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> serde_json::map::Iter<'_> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// The row id held in `id_column`, if it is a string or a number.
    pub fn row_id(&self, id_column: &str) -> Option<RowId> {
        self.get(id_column).and_then(row_key)
    }

    /// Ensure the snapshot targets `row_id`.
    ///
    /// A missing id column is filled in; a present one must agree.
    pub fn with_row_id(mut self, id_column: &str, row_id: &str) -> Result<Self> {
        match self.get(id_column) {
            None | Some(Value::Null) => {
                self.insert(id_column, Value::String(row_id.to_string()));
                Ok(self)
            }
            Some(value) if row_key(value).as_deref() == Some(row_id) => Ok(self),
            Some(value) => Err(Error::InvalidSnapshot(format!(
                "snapshot {id_column} {value} does not match row id {row_id:?}"
            ))),
        }
    }
}

impl FromIterator<(String, Value)> for RowSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Text form of an id column value. Only strings and numbers qualify.
pub fn row_key(value: &Value) -> Option<RowId> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What a change carries, keyed by operation.
///
/// DELETE carries the tombstone (the row before deletion) when the producer
/// recorded one.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
    Insert(RowSnapshot),
    Update(RowSnapshot),
    Delete(Option<RowSnapshot>),
}

impl ChangePayload {
    /// Pair an operation with an optional snapshot, rejecting combinations
    /// that cannot be applied.
    pub fn from_parts(
        operation: Operation,
        snapshot: Option<RowSnapshot>,
        table: &str,
        row_id: &str,
    ) -> Result<Self> {
        match (operation, snapshot) {
            (Operation::Insert, Some(row)) => Ok(ChangePayload::Insert(row)),
            (Operation::Update, Some(row)) => Ok(ChangePayload::Update(row)),
            (Operation::Delete, tombstone) => Ok(ChangePayload::Delete(tombstone)),
            (operation, None) => Err(Error::MissingSnapshot {
                operation,
                table: table.to_string(),
                row_id: row_id.to_string(),
            }),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            ChangePayload::Insert(_) => Operation::Insert,
            ChangePayload::Update(_) => Operation::Update,
            ChangePayload::Delete(_) => Operation::Delete,
        }
    }

    pub fn snapshot(&self) -> Option<&RowSnapshot> {
        match self {
            ChangePayload::Insert(row) | ChangePayload::Update(row) => Some(row),
            ChangePayload::Delete(tombstone) => tombstone.as_ref(),
        }
    }
}

/// One mutation to one row, as recorded by the device that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireChange", into = "WireChange")]
pub struct Change {
    /// Sequence number in the producing device's change log
    pub id: ChangeId,
    pub table_name: TableName,
    pub row_id: RowId,
    pub payload: ChangePayload,
    /// The producer's causal view of this row at capture time
    pub vclock: VectorClock,
    /// Device that produced (or relayed) the change
    pub source: DeviceId,
    /// Wall-clock time, used only as a last-writer-wins tiebreak
    pub modified: Timestamp,
}

impl Change {
    pub fn operation(&self) -> Operation {
        self.payload.operation()
    }

    pub fn snapshot(&self) -> Option<&RowSnapshot> {
        self.payload.snapshot()
    }

    /// Serialize the snapshot as JSON text for storage.
    pub fn data_json(&self) -> Result<Option<String>> {
        self.snapshot()
            .map(|row| serde_json::to_string(row).map_err(Error::from))
            .transpose()
    }
}

/// A JSON field that peers may send either inline or as encoded text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireJson {
    Encoded(String),
    Inline(Value),
}

impl WireJson {
    fn decode(self) -> Result<Value> {
        match self {
            WireJson::Encoded(text) => Ok(serde_json::from_str(&text)?),
            WireJson::Inline(value) => Ok(value),
        }
    }
}

/// The serde shape of a change on the wire and in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChange {
    #[serde(default)]
    pub id: ChangeId,
    pub table_name: TableName,
    pub row_id: RowId,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WireJson>,
    pub vclock: WireJson,
    pub source: DeviceId,
    pub modified: String,
}

impl TryFrom<WireChange> for Change {
    type Error = Error;

    fn try_from(wire: WireChange) -> Result<Self> {
        if wire.table_name.is_empty() {
            return Err(Error::InvalidChange("empty table_name".into()));
        }
        if wire.row_id.is_empty() {
            return Err(Error::InvalidChange("empty row_id".into()));
        }
        if wire.source.is_empty() {
            return Err(Error::InvalidChange("empty source".into()));
        }

        let snapshot = match wire.data.map(WireJson::decode).transpose()? {
            None | Some(Value::Null) => None,
            Some(value) => Some(RowSnapshot::from_value(value)?),
        };
        let payload =
            ChangePayload::from_parts(wire.operation, snapshot, &wire.table_name, &wire.row_id)?;
        let vclock = VectorClock::from_json(&wire.vclock.decode()?)?;
        let modified = Timestamp::parse(&wire.modified)?;

        Ok(Change {
            id: wire.id,
            table_name: wire.table_name,
            row_id: wire.row_id,
            payload,
            vclock,
            source: wire.source,
            modified,
        })
    }
}

impl From<Change> for WireChange {
    fn from(change: Change) -> Self {
        let operation = change.operation();
        let data = match change.payload {
            ChangePayload::Insert(row) | ChangePayload::Update(row) => Some(row),
            ChangePayload::Delete(tombstone) => tombstone,
        };
        let vclock = change
            .vclock
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect::<Map<_, _>>();

        WireChange {
            id: change.id,
            table_name: change.table_name,
            row_id: change.row_id,
            operation,
            data: data.map(|row| WireJson::Inline(row.into_value())),
            vclock: WireJson::Inline(Value::Object(vclock)),
            source: change.source,
            modified: change.modified.to_string(),
        }
    }
}
