//! `NamedValue` — a `(name, value, timestamp)` cell.
//!
//! `set` returns the change it produced, if any, rather than notifying
//! observers directly — callers (here, `Item`) decide what to do with
//! it instead of the cell managing its own observer list.

use chrono::{DateTime, Utc};

use crate::scalar::Scalar;

/// A single named, timestamped value attached to an `Item`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    name: String,
    value: Scalar,
    timestamp: DateTime<Utc>,
}

/// The delta produced by a `NamedValue::set` call that actually changed
/// state. Shaped to match the wire `changed` (named value) event, which
/// carries only `new_value`/`new_timestamp` plus an optional
/// `old_value` — there is no `old_timestamp` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValueChange {
    pub old_value: Option<Scalar>,
    pub new_value: Scalar,
    pub new_timestamp: DateTime<Utc>,
}

impl NamedValue {
    pub fn new(name: impl Into<String>, value: Scalar, timestamp: DateTime<Utc>) -> Self {
        Self { name: name.into(), value, timestamp }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Scalar {
        &self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Replace `(value, timestamp)`. Returns the change iff either
    /// component differs from the previous state.
    pub fn set(&mut self, value: Scalar, timestamp: DateTime<Utc>) -> Option<NamedValueChange> {
        if value == self.value && timestamp == self.timestamp {
            return None;
        }
        let change = NamedValueChange {
            old_value: Some(self.value.clone()),
            new_value: value.clone(),
            new_timestamp: timestamp,
        };
        self.value = value;
        self.timestamp = timestamp;
        Some(change)
    }

    pub fn snapshot(&self) -> NamedValueSnapshot {
        NamedValueSnapshot {
            name: self.name.clone(),
            value: self.value.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn from_snapshot(snap: NamedValueSnapshot) -> Self {
        Self { name: snap.name, value: snap.value, timestamp: snap.timestamp }
    }
}

/// Wire/debug representation of a `NamedValue`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NamedValueSnapshot {
    pub name: String,
    pub value: Scalar,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn set_reports_no_change_when_identical() {
        let mut nv = NamedValue::new("n", Scalar::Number(1.0), ts(1));
        assert!(nv.set(Scalar::Number(1.0), ts(1)).is_none());
    }

    #[test]
    fn set_reports_change_on_value_diff() {
        let mut nv = NamedValue::new("n", Scalar::Number(1.0), ts(1));
        let change = nv.set(Scalar::Number(2.0), ts(1)).unwrap();
        assert_eq!(change.old_value, Some(Scalar::Number(1.0)));
        assert_eq!(change.new_value, Scalar::Number(2.0));
    }

    #[test]
    fn set_reports_change_on_timestamp_diff_alone() {
        let mut nv = NamedValue::new("n", Scalar::Number(1.0), ts(1));
        let change = nv.set(Scalar::Number(1.0), ts(2)).unwrap();
        assert_eq!(change.old_value, Some(Scalar::Number(1.0)));
        assert_eq!(change.new_timestamp, ts(2));
    }

    #[test]
    fn accepts_out_of_order_timestamps() {
        let mut nv = NamedValue::new("n", Scalar::Number(1.0), ts(100));
        // model accepts this: monotonicity is a convention, not enforced
        assert!(nv.set(Scalar::Number(2.0), ts(1)).is_some());
    }

    #[test]
    fn snapshot_roundtrip() {
        let nv = NamedValue::new("n", Scalar::Str("v".into()), ts(5));
        let snap = nv.snapshot();
        let back = NamedValue::from_snapshot(snap);
        assert_eq!(nv, back);
    }
}
