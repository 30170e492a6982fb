// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fetch windows.
//!
//! A [`FetchWindow`] is a half-open `[from, to)` interval that bounds a single
//! vendor request. [`windows`] yields the contiguous sequence covering
//! `[start, stop)` in steps of at most `span`, the last one truncated to `stop`.
//!
//! # Example
//!
//! ```
//! use telemetry_sync::window::windows;
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let start = Utc.timestamp_opt(0, 0).unwrap();
//! let stop = Utc.timestamp_opt(1000, 0).unwrap();
//! let spans: Vec<_> = windows(start, stop, Duration::seconds(300))
//!     .map(|w| (w.from.timestamp(), w.to.timestamp()))
//!     .collect();
//!
//! assert_eq!(spans, vec![(0, 300), (300, 600), (600, 900), (900, 1000)]);
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Half-open time interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl FetchWindow {
    #[must_use]
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    #[must_use]
    pub fn span(&self) -> Duration {
        self.to - self.from
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at < self.to
    }
}

impl std::fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

/// Iterator over contiguous windows; see [`windows`].
#[derive(Debug, Clone)]
pub struct Windows {
    next: DateTime<Utc>,
    stop: DateTime<Utc>,
    span: Duration,
}

impl Iterator for Windows {
    type Item = FetchWindow;

    fn next(&mut self) -> Option<FetchWindow> {
        if self.next >= self.stop {
            return None;
        }
        let from = self.next;
        let to = from
            .checked_add_signed(self.span)
            .map_or(self.stop, |t| t.min(self.stop));
        self.next = to;
        Some(FetchWindow { from, to })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = count_windows(self.next, self.stop, self.span);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Windows {}

/// Windows covering `[start, stop)`.
///
/// Yields nothing when `start >= stop`. A non-positive `span` is treated as
/// "one window for the whole range" so the sequence is always finite.
#[must_use]
pub fn windows(start: DateTime<Utc>, stop: DateTime<Utc>, span: Duration) -> Windows {
    let span = if span <= Duration::zero() {
        stop.signed_duration_since(start).max(Duration::nanoseconds(1))
    } else {
        span
    };
    Windows { next: start, stop, span }
}

/// Number of windows [`windows`] would yield.
#[must_use]
pub fn count_windows(start: DateTime<Utc>, stop: DateTime<Utc>, span: Duration) -> usize {
    if start >= stop || span <= Duration::zero() {
        return usize::from(start < stop);
    }
    let total = (stop - start).num_nanoseconds();
    let step = span.num_nanoseconds();
    match (total, step) {
        (Some(total), Some(step)) => ((total + step - 1) / step) as usize,
        // Ranges beyond ~292 years in nanoseconds: fall back to milliseconds
        _ => {
            let total = (stop - start).num_milliseconds();
            let step = span.num_milliseconds().max(1);
            ((total + step - 1) / step) as usize
        }
    }
}
