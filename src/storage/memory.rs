// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::traits::{truncate_to, MetadataCatalog, StoreError, TimeSeriesStore};
use crate::record::Record;

type Series = BTreeMap<DateTime<Utc>, BTreeMap<String, f64>>;

/// Process-local store with the same upsert semantics as the SQL store.
pub struct InMemoryStore {
    series: DashMap<String, Series>,
    documents: DashMap<(String, String), Value>,
    resolution: chrono::Duration,
    write_calls: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolution(chrono::Duration::microseconds(1))
    }

    /// Store that truncates timestamps to `resolution` (e.g. one second).
    #[must_use]
    pub fn with_resolution(resolution: chrono::Duration) -> Self {
        Self {
            series: DashMap::new(),
            documents: DashMap::new(),
            resolution,
            write_calls: AtomicU64::new(0),
        }
    }

    /// Number of stored rows for a stream
    #[must_use]
    pub fn len(&self, stream_id: &str) -> usize {
        self.series.get(stream_id).map_or(0, |s| s.len())
    }

    /// Check if no stream holds data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.is_empty())
    }

    /// Stream ids with at least one row
    #[must_use]
    pub fn streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .series
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// How many times `write_upsert` was called
    #[must_use]
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// Full series of a stream, ascending
    #[must_use]
    pub fn snapshot(&self, stream_id: &str) -> Vec<Record> {
        self.series
            .get(stream_id)
            .map(|s| {
                s.iter()
                    .map(|(ts, fields)| Record { timestamp: *ts, fields: fields.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clear all data
    pub fn clear(&self) {
        self.series.clear();
        self.documents.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryStore {
    async fn query_last_timestamp(&self, stream_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .series
            .get(stream_id)
            .and_then(|s| s.keys().next_back().copied()))
    }

    async fn write_upsert(&self, stream_id: &str, records: &[Record]) -> Result<usize, StoreError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        if records.is_empty() {
            return Ok(0);
        }
        let mut series = self.series.entry(stream_id.to_string()).or_default();
        let mut written = 0;
        for record in records {
            let mut fields = record.fields.iter().filter(|(_, v)| v.is_finite()).peekable();
            if fields.peek().is_none() {
                continue;
            }
            let row = series
                .entry(truncate_to(record.timestamp, self.resolution))
                .or_default();
            for (field, value) in fields {
                row.insert(field.clone(), *value);
            }
            written += 1;
        }
        Ok(written)
    }

    async fn read_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Record>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .series
            .get(stream_id)
            .map(|s| {
                s.range(from..to)
                    .map(|(ts, fields)| Record { timestamp: *ts, fields: fields.clone() })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn known_fields(&self, stream_id: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .series
            .get(stream_id)
            .map(|s| s.values().flat_map(|f| f.keys().cloned()).collect())
            .unwrap_or_default())
    }

    fn time_resolution(&self) -> chrono::Duration {
        self.resolution
    }
}

#[async_trait]
impl MetadataCatalog for InMemoryStore {
    async fn upsert(&self, collection: &str, key: &str, document: &Value) -> Result<(), StoreError> {
        self.documents
            .insert((collection.to_string(), key.to_string()), document.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .map(|d| d.value().clone()))
    }
}
