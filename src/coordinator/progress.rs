// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Throttled progress lines for long backfills.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub eta: Option<Duration>,
}

pub(crate) struct ProgressReporter<'a> {
    stream_id: &'a str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    verbose: bool,
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(
        stream_id: &'a str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        verbose: bool,
        interval: Duration,
    ) -> Self {
        Self {
            stream_id,
            start,
            stop,
            verbose,
            interval,
            started: Instant::now(),
            last_emit: None,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Report that the loop reached `position`. Emits at most once per interval.
    pub(crate) fn tick(&mut self, position: DateTime<Utc>) -> Option<ProgressUpdate> {
        if !self.verbose {
            return None;
        }
        let now = Instant::now();
        if self.last_emit.is_some_and(|last| now - last < self.interval) {
            return None;
        }
        self.last_emit = Some(now);

        let update = estimate(self.start, self.stop, position, self.elapsed());
        match update.eta {
            Some(eta) => info!(
                stream_id = self.stream_id,
                completed = format_args!("{:.0}%", update.percent),
                seconds_left = eta.as_secs(),
                "Sync progress"
            ),
            None => info!(
                stream_id = self.stream_id,
                completed = format_args!("{:.0}%", update.percent),
                "Sync progress"
            ),
        }
        Some(update)
    }

    pub(crate) fn completed(&self, rows_written: usize) {
        if self.verbose {
            info!(
                stream_id = self.stream_id,
                elapsed_secs = self.elapsed().as_secs(),
                rows_written,
                "Task completed"
            );
        }
    }
}

/// Percent of `[start, stop)` covered at `position`, and the projected time left.
pub fn estimate(
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    position: DateTime<Utc>,
    elapsed: Duration,
) -> ProgressUpdate {
    let total = (stop - start).num_milliseconds();
    if total <= 0 {
        return ProgressUpdate { percent: 100.0, eta: Some(Duration::ZERO) };
    }
    let done = (position - start).num_milliseconds().clamp(0, total);
    let percent = 100.0 * done as f64 / total as f64;

    let eta = (percent > 0.0 && !elapsed.is_zero())
        .then(|| elapsed.mul_f64((100.0 - percent) / percent));
    ProgressUpdate { percent, eta }
}
