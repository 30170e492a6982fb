// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record model.
//!
//! A [`Record`] is the unit of data flowing between every other component:
//! one UTC-timestamped measurement sample with named numeric fields.
//! A [`StreamDescriptor`] identifies the independently checkpointed series
//! the records belong to.
//!
//! # Example
//!
//! ```
//! use telemetry_sync::{Record, dedup_by_timestamp};
//! use chrono::{TimeZone, Utc};
//!
//! let ts = Utc.with_ymd_and_hms(2017, 11, 29, 6, 2, 27).unwrap();
//! let batch = vec![
//!     Record::new(ts).with_field("temperature", 14.6),
//!     Record::new(ts).with_field("temperature", 14.9),
//! ];
//!
//! let collapsed = dedup_by_timestamp(batch);
//! assert_eq!(collapsed.len(), 1);
//! assert_eq!(collapsed[0].get("temperature"), Some(14.9));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One measurement sample.
///
/// Missing fields are absent from `fields`, never implicitly zero. Whether a
/// vendor null becomes an absent field or `0.0` is decided by the adapter's
/// [`NullPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Sample time, always UTC once it has left an adapter
    pub timestamp: DateTime<Utc>,
    /// Field name -> value
    pub fields: BTreeMap<String, f64>,
}

impl Record {
    /// Create an empty record at `timestamp`.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insert.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.fields.insert(name.into(), value);
    }

    /// Apply `policy` to a possibly-null vendor value.
    ///
    /// NaN and infinities count as null.
    pub fn insert_nullable(&mut self, name: impl Into<String>, value: Option<f64>, policy: NullPolicy) {
        match (value.filter(|v| v.is_finite()), policy) {
            (Some(v), _) => {
                self.fields.insert(name.into(), v);
            }
            (None, NullPolicy::ZeroFill) => {
                self.fields.insert(name.into(), 0.0);
            }
            (None, NullPolicy::Omit) => {}
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Remove NaN and infinite fields, returning how many were removed.
    pub fn drop_non_finite(&mut self) -> usize {
        let before = self.fields.len();
        self.fields.retain(|_, v| v.is_finite());
        before - self.fields.len()
    }

    /// Names of the fields present in this record
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// How an adapter treats missing/null numeric values from its vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPolicy {
    /// Leave the field out of the record
    Omit,
    /// Store the field as `0.0`
    ZeroFill,
}

impl std::fmt::Display for NullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Omit => write!(f, "omit"),
            Self::ZeroFill => write!(f, "zero_fill"),
        }
    }
}

/// A logical sub-stream of a source (one device, station module, sensor tag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Stable key, unique within the source (e.g. `ic-meter.5482`)
    pub id: String,
    /// Device-local timezone used by the vendor for wall-clock timestamps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<Tz>,
    /// Earliest data the vendor holds for this stream, if it says so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_measurement: Option<DateTime<Utc>>,
    /// Latest data the vendor holds; fetching past it is pointless
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_measurement: Option<DateTime<Utc>>,
    /// Raw vendor device description (persisted to the metadata catalog)
    #[serde(default)]
    pub metadata: Value,
}

impl StreamDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timezone: None,
            first_measurement: None,
            last_measurement: None,
            metadata: Value::Null,
        }
    }

    #[must_use]
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_first_measurement(mut self, at: DateTime<Utc>) -> Self {
        self.first_measurement = Some(at);
        self
    }

    #[must_use]
    pub fn with_last_measurement(mut self, at: DateTime<Utc>) -> Self {
        self.last_measurement = Some(at);
        self
    }

    /// Timezone to interpret vendor wall-clock values in (UTC if unknown).
    #[must_use]
    pub fn tz(&self) -> Tz {
        self.timezone.unwrap_or(Tz::UTC)
    }
}

/// Collapse records sharing a timestamp; the later record in iteration order wins.
///
/// Output is sorted by timestamp. Input order does not need to be sorted.
#[must_use]
pub fn dedup_by_timestamp(records: Vec<Record>) -> Vec<Record> {
    let mut by_ts: BTreeMap<DateTime<Utc>, Record> = BTreeMap::new();
    for record in records {
        by_ts.insert(record.timestamp, record);
    }
    by_ts.into_values().collect()
}

/// Union of field names across a batch.
#[must_use]
pub fn field_set(records: &[Record]) -> BTreeSet<String> {
    records
        .iter()
        .flat_map(|r| r.fields.keys().cloned())
        .collect()
}
