// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Persistent time-series store.
///
/// The store is the single source of truth for checkpoints: the last
/// timestamp it reports for a stream *is* that stream's checkpoint.
/// Implementations must be safe for concurrent use by several stream workers.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Newest timestamp persisted for `stream_id`, `None` for an empty stream.
    async fn query_last_timestamp(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Upsert `records` keyed by `(stream_id, timestamp, field)`.
    /// Re-writing an overlapping range must not duplicate anything.
    /// Only finite field values are stored; a record left with no field is
    /// not stored at all. Returns the number of records stored.
    async fn write_upsert(&self, stream_id: &str, records: &[Record]) -> Result<usize, StoreError>;

    /// Records with `from <= timestamp < to`, ascending.
    async fn read_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Field names already stored for `stream_id` (empty for a new stream).
    async fn known_fields(&self, stream_id: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Smallest representable timestamp increment.
    fn time_resolution(&self) -> chrono::Duration {
        chrono::Duration::microseconds(1)
    }
}

/// Document catalog for device descriptors. Not on the ingestion path.
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    async fn upsert(&self, collection: &str, key: &str, document: &Value) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;
}

/// Truncate `ts` to a whole multiple of `resolution` since the epoch.
pub(crate) fn truncate_to(ts: DateTime<Utc>, resolution: chrono::Duration) -> DateTime<Utc> {
    let Some(step) = resolution.num_microseconds().filter(|s| *s >= 1) else {
        return ts;
    };
    let micros = ts.timestamp_micros();
    let truncated = micros - micros.rem_euclid(step);
    DateTime::from_timestamp_micros(truncated).unwrap_or(ts)
}
