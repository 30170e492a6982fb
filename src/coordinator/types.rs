// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync orchestrator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::source::traits::{AuthError, FetchError};
use crate::storage::writer::SchemaDriftWarning;
use crate::window::FetchWindow;

/// Terminal status of one stream run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Every attempted window succeeded and nothing was skipped
    Complete,
    /// Some windows failed or the run was cancelled
    Partial,
    /// Every attempted window failed, or the stream could not run at all
    Failed,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Which step of a window failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Fetch,
    Store,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowFailure {
    pub window: FetchWindow,
    pub stage: FailureStage,
    pub error: String,
}

/// Outcome of synchronizing one stream.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub stream_id: String,
    /// Resolved start of the run
    pub start: DateTime<Utc>,
    /// Stop bound captured at loop entry
    pub stop: DateTime<Utc>,
    pub windows_total: usize,
    pub windows_attempted: usize,
    pub windows_succeeded: usize,
    pub windows_failed: usize,
    pub rows_written: usize,
    /// Newest timestamp written during this run
    pub last_written: Option<DateTime<Utc>>,
    pub failures: Vec<WindowFailure>,
    pub drift_warnings: Vec<SchemaDriftWarning>,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub status: StreamStatus,
    /// Stream-level failure (task panic), not a window failure
    pub error: Option<String>,
}

impl RunSummary {
    pub(crate) fn new(
        run_id: Uuid,
        source: &str,
        stream_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            source: source.to_string(),
            stream_id: stream_id.to_string(),
            start,
            stop,
            windows_total: 0,
            windows_attempted: 0,
            windows_succeeded: 0,
            windows_failed: 0,
            rows_written: 0,
            last_written: None,
            failures: Vec::new(),
            drift_warnings: Vec::new(),
            cancelled: false,
            elapsed: Duration::ZERO,
            status: StreamStatus::Complete,
            error: None,
        }
    }

    /// Summary for a stream whose worker never produced one.
    pub(crate) fn aborted(run_id: Uuid, source: &str, stream_id: &str, error: String) -> Self {
        let now = Utc::now();
        let mut summary = Self::new(run_id, source, stream_id, now, now);
        summary.status = StreamStatus::Failed;
        summary.error = Some(error);
        summary
    }

    pub(crate) fn record_failure(&mut self, window: FetchWindow, stage: FailureStage, error: String) {
        self.windows_failed += 1;
        self.failures.push(WindowFailure { window, stage, error });
    }

    /// Derive `status` from the window counters.
    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        self.status = if self.windows_failed > 0 && self.windows_succeeded == 0 {
            StreamStatus::Failed
        } else if self.windows_failed > 0 || self.cancelled {
            StreamStatus::Partial
        } else {
            StreamStatus::Complete
        };
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == StreamStatus::Complete
    }
}

/// Source-level failure: nothing was synchronized for the source.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication with {source_name} failed: {error}")]
    Auth {
        source_name: String,
        #[source]
        error: AuthError,
    },
    #[error("Listing streams of {source_name} failed: {error}")]
    ListStreams {
        source_name: String,
        #[source]
        error: FetchError,
    },
}

/// Outcome of one source within [`super::SyncOrchestrator::sync_sources`].
#[derive(Debug)]
pub struct SourceReport {
    pub source: String,
    pub result: Result<Vec<RunSummary>, SyncError>,
}

impl SourceReport {
    /// Rows written across all streams of the source
    #[must_use]
    pub fn rows_written(&self) -> usize {
        self.result
            .as_ref()
            .map(|s| s.iter().map(|r| r.rows_written).sum())
            .unwrap_or(0)
    }

    /// Source reached and every stream complete
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(s) if s.iter().all(RunSummary::is_complete))
    }
}
