//! Event identity and the flat record builder an event source or caller
//! populates per shot: `event_time`/`fiducials` timestamping and the two
//! reserved keys that may never be set directly.

use std::collections::BTreeMap;

use aggregator_classify::{classify, reject_reserved, KeyKind};
use aggregator_value::{AggregatorError, Result, Value};
use serde::{Deserialize, Serialize};

pub const EVENT_TIME_KEY: &str = "event_time";
pub const FIDUCIALS_KEY: &str = "fiducials";

/// Unique, totally-ordered event identity. `event_time` packs the PTP
/// seconds/nanoseconds pair into one integer so ordering by time is a
/// plain integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub event_time: u64,
    pub fiducials: u32,
}

impl EventId {
    pub fn from_parts(sec: u32, nsec: u32, fiducials: u32) -> Self {
        EventId {
            event_time: ((sec as u64) << 32) | nsec as u64,
            fiducials,
        }
    }

    pub fn sec(self) -> u32 {
        (self.event_time >> 32) as u32
    }

    pub fn nsec(self) -> u32 {
        (self.event_time & 0xFFFF_FFFF) as u32
    }
}

/// A flat key/value record for one event, built up by repeated [`set`]
/// calls and finished off with a timestamp. Nested field names are joined
/// with `/` by the caller (or via [`EventRecord::flatten`]) before `set`.
///
/// [`set`]: EventRecord::set
#[derive(Debug, Clone, Default)]
pub struct EventRecord {
    pub id: Option<EventId>,
    pub fields: BTreeMap<String, Value>,
}

impl EventRecord {
    pub fn new() -> Self {
        EventRecord::default()
    }

    pub fn with_timestamp(sec: u32, nsec: u32, fiducials: u32) -> Self {
        EventRecord {
            id: Some(EventId::from_parts(sec, nsec, fiducials)),
            fields: BTreeMap::new(),
        }
    }

    /// Set a field, rejecting the two reserved keys, a `_len` companion key
    /// (those are derived automatically from their `var_` value's shape, not
    /// set by a caller), and duplicate keys within the same record (a caller
    /// setting the same key twice for one fiducial is almost always a bug
    /// upstream).
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        reject_reserved(&key)?;
        if matches!(classify(&key), KeyKind::Length) {
            return Err(AggregatorError::SchemaViolation(
                key,
                "length keys are derived automatically from their companion variable value and may not be set directly".to_string(),
            ));
        }
        if self.fields.contains_key(&key) {
            return Err(AggregatorError::DuplicateKey(key));
        }
        self.fields.insert(key, value);
        Ok(())
    }

    /// Join a sequence of nested path segments with `/`, the convention
    /// used for hierarchical keys (`"ebeam", "charge"` -> `"ebeam/charge"`).
    pub fn flatten(segments: &[&str]) -> String {
        segments.join("/")
    }
}
