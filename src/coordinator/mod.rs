// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] ties the components together for one run of one
//! or more sources:
//!
//! ```text
//! authenticate → list_streams → per stream (parallel):
//!     catalog upsert → resolve checkpoint → windowed fetch loop → RunSummary
//! ```
//!
//! Streams of a source run concurrently up to `max_concurrent_streams`;
//! windows of one stream run strictly in order. There is no scheduler:
//! callers invoke [`SyncOrchestrator::sync_all`] as often as they like, and
//! every run resumes from what the store already holds.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_sync::{SyncConfig, SyncOrchestrator, InMemoryStore};
//! use telemetry_sync::source::{IcMeterAdapter, IcMeterConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let orchestrator = SyncOrchestrator::new(SyncConfig::default(), store);
//!
//! let adapter = Arc::new(IcMeterAdapter::new(IcMeterConfig::new("user", "secret"))?);
//! for summary in orchestrator.sync_all(adapter).await? {
//!     println!("{}: {} rows ({})", summary.stream_id, summary.rows_written, summary.status);
//! }
//! # Ok(())
//! # }
//! ```

mod fetch_loop;
mod progress;
mod types;

pub use fetch_loop::WindowedFetchLoop;
pub use progress::{estimate, ProgressUpdate};
pub use types::{FailureStage, RunSummary, SourceReport, StreamStatus, SyncError, WindowFailure};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointResolver;
use crate::config::SyncConfig;
use crate::metrics;
use crate::record::StreamDescriptor;
use crate::resilience::rate_limit::RateLimiter;
use crate::source::traits::{Credential, SourceAdapter};
use crate::storage::memory::InMemoryStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{MetadataCatalog, StoreError, TimeSeriesStore};
use crate::storage::writer::StoreWriter;

/// Runs sources against one store.
///
/// The orchestrator is `Send + Sync`; one instance can serve any number of
/// sequential runs. Concurrent runs of the same source are not coordinated.
pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<dyn TimeSeriesStore>,
    writer: Arc<StoreWriter>,
    resolver: Arc<CheckpointResolver>,
    catalog: Option<Arc<dyn MetadataCatalog>>,
    cancel: CancellationToken,
    rate_limiter: Option<Arc<RateLimiter>>,
    in_flight: Arc<AtomicUsize>,
}

/// Everything a stream worker needs, shared by all workers of a run.
struct StreamWorker {
    run_id: Uuid,
    now: DateTime<Utc>,
    resolution: chrono::Duration,
    adapter: Arc<dyn SourceAdapter>,
    credential: Credential,
    fetch_loop: WindowedFetchLoop,
    resolver: Arc<CheckpointResolver>,
    catalog: Option<Arc<dyn MetadataCatalog>>,
    store_timeout: Duration,
}

/// Keeps the in-flight gauge honest even when a worker panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        metrics::set_streams_in_flight(counter.fetch_add(1, Ordering::Relaxed) + 1);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        metrics::set_streams_in_flight(self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1));
    }
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig, store: Arc<dyn TimeSeriesStore>) -> Self {
        let writer = Arc::new(StoreWriter::new(store.clone(), config.store_timeout(), config.store_retry()));
        let resolver = Arc::new(
            CheckpointResolver::new(store.clone(), config.default_lookback()).with_timeout(config.store_timeout()),
        );
        let rate_limiter = config.min_request_interval().map(|i| Arc::new(RateLimiter::new(i)));

        Self {
            config,
            store,
            writer,
            resolver,
            catalog: None,
            cancel: CancellationToken::new(),
            rate_limiter,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build from config: the SQL store (also used as catalog) when `sql_url`
    /// is set, otherwise a process-local in-memory store.
    pub async fn from_config(config: SyncConfig) -> Result<Self, StoreError> {
        match config.sql_url.clone() {
            Some(url) => {
                let sql = Arc::new(SqlStore::new(&url).await?);
                Ok(Self::new(config, sql.clone()).with_catalog(sql))
            }
            None => {
                let memory = Arc::new(InMemoryStore::new());
                Ok(Self::new(config, memory.clone()).with_catalog(memory))
            }
        }
    }

    /// Persist each stream's descriptor to `catalog` before syncing it.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn MetadataCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Stop runs at the next window boundary when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share `limiter` across all stream workers (overrides `min_request_interval_ms`).
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    /// Stream workers currently syncing, across all runs of this orchestrator.
    #[must_use]
    pub fn streams_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Token that cancels this orchestrator's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Synchronize every stream of `adapter` up to now.
    ///
    /// Fails only if the source cannot be authenticated or its streams cannot
    /// be listed. Otherwise returns one summary per stream, in listing order.
    #[instrument(level = "info", skip(self, adapter), fields(source = adapter.name()))]
    pub async fn sync_all(&self, adapter: Arc<dyn SourceAdapter>) -> Result<Vec<RunSummary>, SyncError> {
        let source = adapter.name().to_string();
        let run_id = Uuid::new_v4();

        let credential = adapter.authenticate().await.map_err(|error| {
            error!(error = %error, "Authentication failed");
            metrics::record_source_error(&source, "auth");
            SyncError::Auth { source_name: source.clone(), error }
        })?;

        let streams = {
            let _timer = metrics::LatencyTimer::new("list_streams");
            adapter.list_streams(&credential).await
        }
        .map_err(|error| {
            error!(error = %error, "Listing streams failed");
            metrics::record_source_error(&source, "list_streams");
            SyncError::ListStreams { source_name: source.clone(), error }
        })?;

        info!(%run_id, streams = streams.len(), "Starting sync run");

        let mut fetch_loop = WindowedFetchLoop::new(self.writer.clone(), &self.config)
            .with_cancellation(self.cancel.clone());
        if let Some(limiter) = &self.rate_limiter {
            fetch_loop = fetch_loop.with_rate_limiter(limiter.clone());
        }

        let worker = Arc::new(StreamWorker {
            run_id,
            now: Utc::now(),
            resolution: self.store.time_resolution(),
            adapter,
            credential,
            fetch_loop,
            resolver: self.resolver.clone(),
            catalog: self.catalog.clone(),
            store_timeout: self.config.store_timeout(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_streams.max(1)));
        let mut join_set: JoinSet<(usize, RunSummary)> = JoinSet::new();

        for (i, stream) in streams.iter().cloned().enumerate() {
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let in_flight = self.in_flight.clone();

            join_set.spawn(async move {
                // Semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                let _in_flight = InFlightGuard::enter(in_flight);
                (i, worker.sync_stream(&stream).await)
            });
        }

        let mut results: Vec<Option<RunSummary>> = vec![None; streams.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((i, summary)) => results[i] = Some(summary),
                Err(e) => error!(error = %e, "Stream worker aborted"),
            }
        }

        let summaries: Vec<RunSummary> = results
            .into_iter()
            .zip(&streams)
            .map(|(summary, stream)| {
                summary.unwrap_or_else(|| {
                    // A panicking worker never reports back
                    metrics::record_stream_run(&source, "failed");
                    RunSummary::aborted(run_id, &source, &stream.id, "stream worker panicked".to_string())
                })
            })
            .collect();

        let rows: usize = summaries.iter().map(|s| s.rows_written).sum();
        let complete = summaries.iter().filter(|s| s.is_complete()).count();
        info!(%run_id, streams = summaries.len(), complete, rows_written = rows, "Sync run finished");
        Ok(summaries)
    }

    /// Run several sources one after another. Never fails; each source's
    /// outcome, including source-level errors, is in its report.
    pub async fn sync_sources(&self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Vec<SourceReport> {
        let mut reports = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let source = adapter.name().to_string();
            let result = self.sync_all(adapter).await;
            reports.push(SourceReport { source, result });
        }
        reports
    }
}

impl StreamWorker {
    async fn sync_stream(&self, stream: &StreamDescriptor) -> RunSummary {
        if let Some(catalog) = &self.catalog {
            let upsert = catalog.upsert(self.adapter.name(), &stream.id, &stream.metadata);
            match tokio::time::timeout(self.store_timeout, upsert).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(stream_id = %stream.id, error = %e, "Catalog upsert failed, continuing"),
                Err(_) => warn!(stream_id = %stream.id, timeout = ?self.store_timeout, "Catalog upsert timed out, continuing"),
            }
        }

        let resolution = self.resolver.resolve_stream(stream, self.now).await;
        // The vendor's last measurement itself must fall inside [start, stop)
        let stop = match stream.last_measurement.and_then(|last| last.checked_add_signed(self.resolution)) {
            Some(end) => end.min(self.now),
            None => self.now,
        };

        self.fetch_loop
            .run_as(self.run_id, self.adapter.as_ref(), &self.credential, stream, resolution.start, stop)
            .await
    }
}
