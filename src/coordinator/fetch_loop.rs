// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Windowed fetch loop for a single stream.
//!
//! Drains `[start, stop)` in contiguous windows, oldest first. Each window is
//! fetched, retried if the error is transient, and written before the loop
//! moves on, so the store's last timestamp always marks a fully committed
//! prefix of the run. A failed window is recorded and skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::progress::ProgressReporter;
use super::types::{FailureStage, RunSummary};
use crate::config::SyncConfig;
use crate::metrics;
use crate::record::{Record, StreamDescriptor};
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::retry::{retry_if, RetryPolicy};
use crate::source::traits::{Credential, FetchError, SourceAdapter};
use crate::storage::writer::StoreWriter;
use crate::window::{windows, FetchWindow};

pub struct WindowedFetchLoop {
    writer: Arc<StoreWriter>,
    window: chrono::Duration,
    fetch_timeout: Duration,
    fetch_retry: RetryPolicy,
    verbose: bool,
    progress_interval: Duration,
    cancel: CancellationToken,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl WindowedFetchLoop {
    pub fn new(writer: Arc<StoreWriter>, config: &SyncConfig) -> Self {
        Self {
            writer,
            window: config.window(),
            fetch_timeout: config.fetch_timeout(),
            fetch_retry: config.fetch_retry(),
            verbose: config.verbose,
            progress_interval: config.progress_interval(),
            cancel: CancellationToken::new(),
            rate_limiter: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Run one stream from `start` to `stop` under a fresh run id.
    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        credential: &Credential,
        stream: &StreamDescriptor,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> RunSummary {
        self.run_as(Uuid::new_v4(), adapter, credential, stream, start, stop).await
    }

    #[instrument(
        level = "info",
        skip(self, adapter, credential, stream),
        fields(source = adapter.name(), stream_id = %stream.id)
    )]
    pub(crate) async fn run_as(
        &self,
        run_id: Uuid,
        adapter: &dyn SourceAdapter,
        credential: &Credential,
        stream: &StreamDescriptor,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> RunSummary {
        let source = adapter.name();
        let mut summary = RunSummary::new(run_id, source, &stream.id, start, stop);
        let mut progress = ProgressReporter::new(&stream.id, start, stop, self.verbose, self.progress_interval);

        if start >= stop {
            info!(%start, %stop, "No new data available, skipping");
            summary.finish(progress.elapsed());
            return summary;
        }

        let plan = windows(start, stop, self.window);
        summary.windows_total = plan.len();
        info!(%start, %stop, windows = summary.windows_total, "Downloading stream");

        for window in plan {
            if self.cancel.is_cancelled() {
                info!(next_window = %window, "Cancelled, stopping at window boundary");
                summary.cancelled = true;
                break;
            }
            progress.tick(window.from);
            summary.windows_attempted += 1;

            let records = match self.fetch_window(adapter, credential, stream, window).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(%window, error = %e, "Window fetch failed, continuing");
                    metrics::record_window(source, "fetch_failed");
                    summary.record_failure(window, FailureStage::Fetch, e.to_string());
                    continue;
                }
            };

            if records.is_empty() {
                debug!(%window, "Window empty");
                summary.windows_succeeded += 1;
                metrics::record_window(source, "empty");
                continue;
            }

            let newest = records.iter().map(|r| r.timestamp).max();
            match self.writer.write(&stream.id, records).await {
                Ok(outcome) => {
                    summary.windows_succeeded += 1;
                    summary.rows_written += outcome.rows_written;
                    summary.last_written = summary.last_written.max(newest);
                    summary.drift_warnings.extend(outcome.drift);
                    metrics::record_window(source, "success");
                    metrics::record_rows_written(source, outcome.rows_written);
                }
                Err(e) => {
                    warn!(%window, error = %e, "Window write failed, continuing");
                    metrics::record_window(source, "store_failed");
                    summary.record_failure(window, FailureStage::Store, e.to_string());
                }
            }
        }

        summary.finish(progress.elapsed());
        progress.completed(summary.rows_written);
        info!(
            status = %summary.status,
            windows_succeeded = summary.windows_succeeded,
            windows_failed = summary.windows_failed,
            rows_written = summary.rows_written,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Stream run finished"
        );
        metrics::record_stream_run(source, &summary.status.to_string());
        summary
    }

    async fn fetch_window(
        &self,
        adapter: &dyn SourceAdapter,
        credential: &Credential,
        stream: &StreamDescriptor,
        window: FetchWindow,
    ) -> Result<Vec<Record>, FetchError> {
        let _timer = metrics::LatencyTimer::new("fetch");
        let mut attempt = 0usize;
        retry_if(
            "window_fetch",
            &self.fetch_retry,
            || {
                attempt += 1;
                if attempt > 1 {
                    metrics::record_retry("fetch");
                }
                async move {
                    if let Some(limiter) = &self.rate_limiter {
                        limiter.acquire().await;
                    }
                    match tokio::time::timeout(self.fetch_timeout, adapter.fetch(credential, stream, window)).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout),
                    }
                }
            },
            FetchError::is_retryable,
        )
        .await
    }
}
