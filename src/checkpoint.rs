// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint resolution.
//!
//! There is no checkpoint table: a stream's checkpoint is the newest
//! timestamp the store holds for it. Resuming at `checkpoint + resolution`
//! means the persisted row is never fetched again, and a crash between two
//! windows loses nothing that was committed.
//!
//! An empty stream and a failed query both fall back to the same start, but
//! they are reported through [`CheckpointOrigin`] and logged differently so a
//! broken store is never mistaken for a new device.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::metrics;
use crate::record::StreamDescriptor;
use crate::storage::traits::{StoreError, TimeSeriesStore};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOrigin {
    /// Store returned a last timestamp
    Checkpoint,
    /// Store has no data for the stream
    EmptyStream,
    /// Store query failed; fallback used
    QueryFailed,
}

impl CheckpointOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointOrigin::Checkpoint => "checkpoint",
            CheckpointOrigin::EmptyStream => "empty_stream",
            CheckpointOrigin::QueryFailed => "query_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub start: DateTime<Utc>,
    pub origin: CheckpointOrigin,
}

pub struct CheckpointResolver {
    store: Arc<dyn TimeSeriesStore>,
    default_lookback: chrono::Duration,
    timeout: Duration,
}

impl CheckpointResolver {
    pub fn new(store: Arc<dyn TimeSeriesStore>, default_lookback: chrono::Duration) -> Self {
        Self {
            store,
            default_lookback,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Bound the checkpoint query; an elapsed query counts as failed.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Next start timestamp for `stream_id`, using the wall clock for the fallback.
    pub async fn resolve(&self, stream_id: &str) -> DateTime<Utc> {
        self.resolve_at(stream_id, Utc::now(), None).await.start
    }

    /// Resolve a stream using its vendor-reported first measurement as the fallback.
    pub async fn resolve_stream(&self, stream: &StreamDescriptor, now: DateTime<Utc>) -> Resolution {
        self.resolve_at(&stream.id, now, stream.first_measurement).await
    }

    /// Resolve against an explicit clock. `hint` replaces `now - default_lookback`
    /// as the fallback when given. Never fails.
    pub async fn resolve_at(
        &self,
        stream_id: &str,
        now: DateTime<Utc>,
        hint: Option<DateTime<Utc>>,
    ) -> Resolution {
        let fallback = hint.unwrap_or_else(|| {
            now.checked_sub_signed(self.default_lookback)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });

        let _timer = metrics::LatencyTimer::new("checkpoint");
        let last = tokio::time::timeout(self.timeout, self.store.query_last_timestamp(stream_id))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.timeout)));
        let resolution = match last {
            Ok(Some(last)) => {
                let start = last
                    .checked_add_signed(self.store.time_resolution())
                    .unwrap_or(last);
                debug!(stream_id, %last, %start, "Resuming from checkpoint");
                Resolution { start, origin: CheckpointOrigin::Checkpoint }
            }
            Ok(None) => {
                debug!(stream_id, start = %fallback, "No stored data, starting from fallback");
                Resolution { start: fallback, origin: CheckpointOrigin::EmptyStream }
            }
            Err(e) => {
                warn!(
                    stream_id,
                    error = %e,
                    start = %fallback,
                    "Checkpoint query failed, starting from fallback"
                );
                Resolution { start: fallback, origin: CheckpointOrigin::QueryFailed }
            }
        };

        metrics::record_checkpoint(resolution.origin.as_str());
        resolution
    }
}
