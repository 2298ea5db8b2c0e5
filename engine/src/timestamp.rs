//! Wall-clock timestamps used for last-writer-wins tiebreaks.
//!
//! Timestamps are always rendered as `YYYY-MM-DD HH:MM:SS.fff` (UTC) so that
//! comparing the strings stored in SQLite agrees with comparing the times.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const PARSE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// A UTC timestamp with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    /// The sentinel used when a record has never been modified locally.
    pub const EPOCH: Timestamp = Timestamp(DateTime::<Utc>::UNIX_EPOCH.naive_utc());

    /// Current UTC time, truncated to milliseconds.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now().naive_utc())
    }

    /// Current time, or one millisecond past `previous` if the clock has not
    /// moved beyond it yet. Keeps successive local writes to a row strictly
    /// ordered.
    pub fn after(previous: Option<&Timestamp>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if now <= *prev => Timestamp(prev.0 + Duration::milliseconds(1)),
            _ => now,
        }
    }

    /// Parse a timestamp in any of the accepted layouts.
    ///
    /// Accepts a space or `T` between date and time, an optional fraction of
    /// up to nine digits and an optional trailing `Z`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let normalized = trimmed.strip_suffix('Z').unwrap_or(trimmed).replacen('T', " ", 1);

        PARSE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(&normalized, format).ok())
            .map(Self::from_datetime)
            .ok_or_else(|| Error::InvalidTimestamp(input.to_string()))
    }

    /// The underlying naive UTC datetime.
    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }

    fn from_datetime(datetime: NaiveDateTime) -> Self {
        let nanos = datetime.nanosecond() / 1_000_000 * 1_000_000;
        Timestamp(datetime.with_nanosecond(nanos).unwrap_or(datetime))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.to_string()
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Timestamp::parse(text).map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_renders_canonically() {
        assert_eq!(Timestamp::EPOCH.to_string(), "1970-01-01 00:00:00.000");
        assert_eq!(Timestamp::default(), Timestamp::EPOCH);
    }

    #[test]
    fn parses_accepted_layouts() {
        let expected = "2024-03-01 12:30:45.120";
        for input in [
            "2024-03-01 12:30:45.12",
            "2024-03-01T12:30:45.120Z",
            "2024-03-01T12:30:45.120999",
            "2024-03-01 12:30:45.120000000",
        ] {
            assert_eq!(Timestamp::parse(input).unwrap().to_string(), expected, "{input}");
        }

        let whole = Timestamp::parse("2024-03-01 12:30:45").unwrap();
        assert_eq!(whole.to_string(), "2024-03-01 12:30:45.000");
    }

    #[test]
    fn rejects_garbage() {
        for input in ["", "yesterday", "2024-13-01 00:00:00", "2024-03-01"] {
            assert!(
                matches!(Timestamp::parse(input), Err(Error::InvalidTimestamp(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn string_order_matches_time_order() {
        let a = Timestamp::parse("2024-03-01 09:00:00.5").unwrap();
        let b = Timestamp::parse("2024-03-01 10:00:00").unwrap();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn after_is_strictly_later() {
        let future = Timestamp::parse("2999-01-01 00:00:00.000").unwrap();
        let next = Timestamp::after(Some(&future));
        assert_eq!(next.to_string(), "2999-01-01 00:00:00.001");

        let past = Timestamp::EPOCH;
        assert!(Timestamp::after(Some(&past)) > past);
        assert!(Timestamp::after(None) > Timestamp::EPOCH);
    }

    #[test]
    fn serializes_as_string() {
        let ts = Timestamp::parse("2024-03-01T12:30:45Z").unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2024-03-01 12:30:45.000\"");

        let parsed: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ts);
        assert!(serde_json::from_str::<Timestamp>("\"not a time\"").is_err());
    }
}
