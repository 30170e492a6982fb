// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for telemetry-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `telemetry_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `source`: adapter name (ic-meter, wirelesstag, netatmo, ...)
//! - `operation`: fetch, write, checkpoint, list_streams
//! - `status`: complete, partial, failed / success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "telemetry_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the outcome of one fetch window
pub fn record_window(source: &str, status: &str) {
    counter!(
        "telemetry_sync_windows_total",
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a retried fetch or write attempt
pub fn record_retry(operation: &str) {
    counter!(
        "telemetry_sync_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record rows persisted for a source
pub fn record_rows_written(source: &str, count: usize) {
    counter!(
        "telemetry_sync_rows_written_total",
        "source" => source.to_string()
    )
    .increment(count as u64);
}

/// Record how a checkpoint was resolved (checkpoint, empty_stream, query_failed)
pub fn record_checkpoint(origin: &str) {
    counter!(
        "telemetry_sync_checkpoints_total",
        "origin" => origin.to_string()
    )
    .increment(1);
}

/// Record a schema drift warning
pub fn record_schema_drift() {
    counter!("telemetry_sync_schema_drift_total").increment(1);
}

/// Record the terminal status of one stream run
pub fn record_stream_run(source: &str, status: &str) {
    counter!(
        "telemetry_sync_stream_runs_total",
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a source-level failure (authentication or stream listing)
pub fn record_source_error(source: &str, stage: &str) {
    counter!(
        "telemetry_sync_source_errors_total",
        "source" => source.to_string(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Set number of stream workers currently running
pub fn set_streams_in_flight(count: usize) {
    gauge!("telemetry_sync_streams_in_flight").set(count as f64);
}

/// RAII guard that records elapsed time on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn counter_value(
        snapshot: &[(metrics_util::CompositeKey, Option<metrics::Unit>, Option<metrics::SharedString>, DebugValue)],
        name: &str,
    ) -> u64 {
        snapshot
            .iter()
            .filter(|(key, ..)| key.key().name() == name)
            .map(|(.., value)| match value {
                DebugValue::Counter(v) => *v,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_counters_are_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_window("ic-meter", "success");
            record_window("ic-meter", "failed");
            record_rows_written("ic-meter", 42);
            record_schema_drift();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(counter_value(&snapshot, "telemetry_sync_windows_total"), 2);
        assert_eq!(counter_value(&snapshot, "telemetry_sync_rows_written_total"), 42);
        assert_eq!(counter_value(&snapshot, "telemetry_sync_schema_drift_total"), 1);
    }

    #[test]
    fn test_without_recorder_is_noop() {
        record_retry("fetch");
        record_checkpoint("empty_stream");
        record_stream_run("netatmo", "partial");
        record_source_error("netatmo", "auth");
        set_streams_in_flight(3);
    }

    #[test]
    fn test_latency_timer() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let _timer = LatencyTimer::new("fetch");
            std::thread::sleep(Duration::from_micros(10));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let recorded = snapshot.iter().any(|(key, _, _, value)| {
            key.key().name() == "telemetry_sync_operation_seconds"
                && matches!(value, DebugValue::Histogram(v) if v.len() == 1)
        });
        assert!(recorded);
    }
}
