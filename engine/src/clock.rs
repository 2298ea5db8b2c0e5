//! Vector clocks for detecting causal order and concurrency.
//!
//! A [`VectorClock`] maps participant (device) ids to counters. Each device
//! only ever increments its own entry, by exactly one per local write.
//! [`ClockComparison`] classifies an incoming clock against the local one.

use crate::error::{Error, Result};
use crate::{DeviceId, Timestamp};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// A per-participant counter map. Absent entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<DeviceId, u64>);

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(participant, counter)` pairs.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<DeviceId>,
    {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Counter for `participant`, zero when absent.
    pub fn get(&self, participant: &str) -> u64 {
        self.0.get(participant).copied().unwrap_or(0)
    }

    /// Set the counter for `participant`.
    pub fn set(&mut self, participant: impl Into<DeviceId>, counter: u64) {
        self.0.insert(participant.into(), counter);
    }

    /// Increment `participant`'s counter by one and return the new value.
    ///
    /// Fails when the counter is already at `u64::MAX`.
    pub fn increment(&mut self, participant: &str) -> Result<u64> {
        let counter = self.0.entry(participant.to_string()).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::ClockOverflow(participant.to_string()))?;
        Ok(*counter)
    }

    /// Whether `participant` has an explicit entry (even a zero one).
    pub fn contains(&self, participant: &str) -> bool {
        self.0.contains_key(participant)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, DeviceId, u64> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Element-wise maximum of both clocks, with `local_id` guaranteed present.
    pub fn merge(&self, other: &VectorClock, local_id: &str) -> VectorClock {
        let mut merged = self.clone();
        for (participant, &counter) in other.iter() {
            let entry = merged.0.entry(participant.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        merged.0.entry(local_id.to_string()).or_insert(0);
        merged
    }

    /// Parse a clock from a JSON object of non-negative integer counters.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidVectorClock(format!("expected an object, got {value}")))?;

        let mut clock = VectorClock::new();
        for (participant, counter) in object {
            let counter = counter.as_u64().ok_or_else(|| {
                Error::InvalidVectorClock(format!(
                    "counter for '{participant}' must be a non-negative integer, got {counter}"
                ))
            })?;
            clock.set(participant.clone(), counter);
        }
        Ok(clock)
    }

    fn participants<'a>(&'a self, other: &'a VectorClock) -> impl Iterator<Item = &'a DeviceId> {
        self.0
            .keys()
            .chain(other.0.keys().filter(move |k| !self.0.contains_key(*k)))
    }
}

impl<'a> IntoIterator for &'a VectorClock {
    type Item = (&'a DeviceId, &'a u64);
    type IntoIter = btree_map::Iter<'a, DeviceId, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// Stored as JSON text.
impl ToSql for VectorClock {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let json = serde_json::to_string(&self.0)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        Ok(ToSqlOutput::from(json))
    }
}

impl FromSql for VectorClock {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let json: serde_json::Value = serde_json::from_str(value.as_str()?)
            .map_err(|err| FromSqlError::Other(Box::new(err)))?;
        VectorClock::from_json(&json).map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

/// Comparison of a local clock against an incoming one.
///
/// Pure: nothing here mutates either clock.
#[derive(Debug, Clone, Copy)]
pub struct ClockComparison<'a> {
    local: &'a VectorClock,
    remote: &'a VectorClock,
    local_id: &'a str,
    local_time: Timestamp,
    remote_time: Timestamp,
}

impl<'a> ClockComparison<'a> {
    /// `local_time` falls back to [`Timestamp::EPOCH`] when absent, so that a
    /// record with no local history always loses the time comparison.
    pub fn new(
        local: &'a VectorClock,
        remote: &'a VectorClock,
        local_id: &'a str,
        local_time: Option<Timestamp>,
        remote_time: Timestamp,
    ) -> Self {
        Self {
            local,
            remote,
            local_id,
            local_time: local_time.unwrap_or(Timestamp::EPOCH),
            remote_time,
        }
    }

    /// Neither clock dominates: some entry is ahead locally and some entry
    /// is ahead remotely.
    pub fn is_conflicted(&self) -> bool {
        let mut local_ahead = false;
        let mut remote_ahead = false;

        for participant in self.local.participants(self.remote) {
            let local = self.local.get(participant);
            let remote = self.remote.get(participant);
            local_ahead |= local > remote;
            remote_ahead |= local < remote;
            if local_ahead && remote_ahead {
                return true;
            }
        }
        false
    }

    /// Some third-party entry differs by more than one, meaning a change from
    /// that participant has not been seen yet.
    pub fn is_out_of_order(&self) -> bool {
        self.local
            .participants(self.remote)
            .filter(|participant| participant.as_str() != self.local_id)
            .any(|participant| {
                self.local.get(participant).abs_diff(self.remote.get(participant)) > 1
            })
    }

    /// The local copy was modified at or after the incoming change.
    pub fn is_out_dated(&self) -> bool {
        self.local_time >= self.remote_time
    }

    /// See [`VectorClock::merge`].
    pub fn merge(&self) -> VectorClock {
        self.local.merge(self.remote, self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_entries(entries.iter().map(|&(k, v)| (k, v)))
    }

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    fn compare<'a>(local: &'a VectorClock, remote: &'a VectorClock) -> ClockComparison<'a> {
        ClockComparison::new(local, remote, "A", None, ts("2024-01-01 00:00:00"))
    }

    #[test]
    fn absent_entries_read_as_zero() {
        let c = clock(&[("A", 3)]);
        assert_eq!(c.get("A"), 3);
        assert_eq!(c.get("B"), 0);
        assert!(!c.contains("B"));
    }

    #[test]
    fn increment_starts_from_zero() {
        let mut c = VectorClock::new();
        assert_eq!(c.increment("A").unwrap(), 1);
        assert_eq!(c.increment("A").unwrap(), 2);
        assert_eq!(c.get("A"), 2);
    }

    #[test]
    fn increment_at_max_fails_and_keeps_counter() {
        let mut c = clock(&[("A", u64::MAX)]);
        assert!(matches!(c.increment("A"), Err(Error::ClockOverflow(id)) if id == "A"));
        assert_eq!(c.get("A"), u64::MAX);
    }

    #[test]
    fn concurrent_clocks_conflict() {
        let local = clock(&[("A", 1)]);
        let remote = clock(&[("B", 1)]);
        assert!(compare(&local, &remote).is_conflicted());
    }

    #[test]
    fn dominating_clocks_do_not_conflict() {
        let local = clock(&[("A", 1), ("B", 1)]);
        let remote = clock(&[("A", 1), ("B", 2)]);
        assert!(!compare(&local, &remote).is_conflicted());
        assert!(!compare(&remote, &local).is_conflicted());
    }

    #[test]
    fn drift_of_two_is_out_of_order() {
        let local = clock(&[("A", 5), ("B", 1)]);
        let remote = clock(&[("A", 5), ("B", 3)]);
        assert!(compare(&local, &remote).is_out_of_order());
    }

    #[test]
    fn drift_of_one_is_in_order() {
        let local = clock(&[("A", 5), ("B", 1)]);
        let remote = clock(&[("A", 5), ("B", 2)]);
        assert!(!compare(&local, &remote).is_out_of_order());
    }

    #[test]
    fn local_entry_drift_is_ignored() {
        let local = clock(&[("A", 9)]);
        let remote = clock(&[("A", 2)]);
        assert!(!compare(&local, &remote).is_out_of_order());
    }

    #[test]
    fn out_dated_uses_epoch_when_local_time_absent() {
        let empty = VectorClock::new();
        let remote = clock(&[("B", 1)]);
        let cmp = ClockComparison::new(&empty, &remote, "A", None, ts("2024-01-01 00:00:00"));
        assert!(!cmp.is_out_dated());

        let same = ts("2024-01-01 00:00:00");
        let cmp = ClockComparison::new(&empty, &remote, "A", Some(same), same);
        assert!(cmp.is_out_dated());
    }

    #[test]
    fn merge_takes_max_and_adds_local_id() {
        let local = VectorClock::new();
        let remote = clock(&[("B", 1)]);
        assert_eq!(compare(&local, &remote).merge(), clock(&[("A", 0), ("B", 1)]));

        let local = clock(&[("A", 4), ("B", 1)]);
        let remote = clock(&[("B", 3), ("C", 2)]);
        assert_eq!(
            compare(&local, &remote).merge(),
            clock(&[("A", 4), ("B", 3), ("C", 2)])
        );
    }

    #[test]
    fn from_json_validates_counters() {
        let c = VectorClock::from_json(&json!({"A": 1, "B": 0})).unwrap();
        assert_eq!(c, clock(&[("A", 1), ("B", 0)]));

        for bad in [json!({"A": -1}), json!({"A": 1.5}), json!({"A": "1"}), json!([1])] {
            assert!(matches!(
                VectorClock::from_json(&bad),
                Err(Error::InvalidVectorClock(_))
            ));
        }
    }

    #[test]
    fn serialization_format() {
        let c = clock(&[("B", 2), ("A", 1)]);
        assert_eq!(serde_json::to_string(&c).unwrap(), r#"{"A":1,"B":2}"#);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_clock() -> impl Strategy<Value = VectorClock> {
            prop::collection::btree_map("[A-D]", 0u64..50, 0..4).prop_map(VectorClock)
        }

        proptest! {
            #[test]
            fn merge_is_commutative(a in arb_clock(), b in arb_clock()) {
                prop_assert_eq!(a.merge(&b, "A"), b.merge(&a, "A"));
            }

            #[test]
            fn merge_is_idempotent(a in arb_clock(), b in arb_clock()) {
                let once = a.merge(&b, "A");
                prop_assert_eq!(once.merge(&b, "A"), once);
            }

            #[test]
            fn merge_dominates_both(a in arb_clock(), b in arb_clock()) {
                let merged = a.merge(&b, "A");
                for (k, v) in a.iter().chain(b.iter()) {
                    prop_assert!(merged.get(k) >= *v);
                }
                prop_assert!(merged.contains("A"));
            }

            #[test]
            fn clock_never_conflicts_with_itself(a in arb_clock()) {
                let cmp = ClockComparison::new(&a, &a, "A", None, Timestamp::EPOCH);
                prop_assert!(!cmp.is_conflicted());
                prop_assert!(!cmp.is_out_of_order());
            }

            #[test]
            fn single_step_drift_is_never_out_of_order(
                a in arb_clock(),
                bumps in prop::collection::vec(("[B-D]", 0u64..2), 0..4),
            ) {
                let mut b = a.clone();
                for (k, step) in bumps {
                    let value = a.get(&k) + step;
                    b.set(k, value);
                }
                let cmp = ClockComparison::new(&a, &b, "A", None, Timestamp::EPOCH);
                prop_assert!(!cmp.is_out_of_order());
            }

            #[test]
            fn two_step_drift_is_out_of_order(a in arb_clock(), k in "[B-D]") {
                let mut b = a.clone();
                b.set(k.clone(), a.get(&k) + 2);
                let cmp = ClockComparison::new(&a, &b, "A", None, Timestamp::EPOCH);
                prop_assert!(cmp.is_out_of_order());
            }
        }
    }
}
