// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch writer sitting between the fetch loop and a [`TimeSeriesStore`].
//!
//! Each call collapses duplicate timestamps, checks the batch against the
//! stream's known field set, and upserts through the store under a timeout
//! and the store retry policy.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::traits::{StoreError, TimeSeriesStore};
use crate::metrics;
use crate::record::{dedup_by_timestamp, field_set, Record};
use crate::resilience::retry::{retry, RetryPolicy};

/// A batch whose fields share nothing with what the stream stored before.
///
/// Usually the vendor renamed its columns. The batch is still written.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDriftWarning {
    pub stream_id: String,
    pub known: BTreeSet<String>,
    pub observed: BTreeSet<String>,
}

impl fmt::Display for SchemaDriftWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {} changed fields: known {:?}, observed {:?}",
            self.stream_id, self.known, self.observed
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub rows_written: usize,
    pub drift: Option<SchemaDriftWarning>,
}

pub struct StoreWriter {
    store: Arc<dyn TimeSeriesStore>,
    timeout: Duration,
    policy: RetryPolicy,
    schemas: DashMap<String, BTreeSet<String>>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn TimeSeriesStore>, timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            store,
            timeout,
            policy,
            schemas: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    /// Dedup, drift-check and upsert one batch.
    ///
    /// NaN and infinite values are dropped, then records left without any
    /// field. `rows_written` counts only records the store persisted.
    pub async fn write(&self, stream_id: &str, records: Vec<Record>) -> Result<WriteOutcome, StoreError> {
        let mut records = dedup_by_timestamp(records);
        let dropped: usize = records.iter_mut().map(Record::drop_non_finite).sum();
        if dropped > 0 {
            warn!(stream_id, dropped, "Dropped non-finite field values");
        }
        records.retain(|r| !r.is_empty());
        if records.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let observed = field_set(&records);
        let drift = self.check_drift(stream_id, &observed).await;

        let _timer = metrics::LatencyTimer::new("write");
        let mut attempt = 0usize;
        let rows_written = retry("store_write", &self.policy, || {
            attempt += 1;
            if attempt > 1 {
                metrics::record_retry("write");
            }
            let records = &records;
            async move {
                match tokio::time::timeout(self.timeout, self.store.write_upsert(stream_id, records)).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(self.timeout)),
                }
            }
        })
        .await?;

        self.schemas
            .entry(stream_id.to_string())
            .or_default()
            .extend(observed);

        debug!(stream_id, rows_written, "Batch written");
        Ok(WriteOutcome { rows_written, drift })
    }

    async fn check_drift(&self, stream_id: &str, observed: &BTreeSet<String>) -> Option<SchemaDriftWarning> {
        if observed.is_empty() {
            return None;
        }

        let cached = self.schemas.get(stream_id).map(|known| known.clone());
        let known = match cached {
            Some(known) => known,
            None => {
                let seeded = match tokio::time::timeout(self.timeout, self.store.known_fields(stream_id)).await {
                    Ok(Ok(fields)) => fields,
                    Ok(Err(e)) => {
                        warn!(stream_id, error = %e, "Could not load known fields, skipping drift check");
                        BTreeSet::new()
                    }
                    Err(_) => {
                        warn!(stream_id, timeout = ?self.timeout, "Loading known fields timed out, skipping drift check");
                        BTreeSet::new()
                    }
                };
                self.schemas
                    .entry(stream_id.to_string())
                    .or_default()
                    .extend(seeded.iter().cloned());
                seeded
            }
        };

        if known.is_empty() || !known.is_disjoint(observed) {
            return None;
        }

        let warning = SchemaDriftWarning {
            stream_id: stream_id.to_string(),
            known,
            observed: observed.clone(),
        };
        warn!(
            stream_id,
            known = ?warning.known,
            observed = ?warning.observed,
            "Schema drift: batch shares no fields with stored data"
        );
        metrics::record_schema_drift();
        Some(warning)
    }
}
