// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Minimum-interval rate limiter shared by all stream workers of a run.
//!
//! Vendor APIs rate-limit per account, not per device, so parallel stream
//! workers must share one gate. Callers await [`RateLimiter::acquire`] before
//! each request; grants are spaced at least `min_interval` apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

pub struct RateLimiter {
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
    grants: AtomicU64,
    throttled: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_grant: Mutex::new(None),
            grants: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request may be sent.
    ///
    /// The lock is held across the sleep so waiters are served in order.
    pub async fn acquire(&self) {
        let mut last = self.last_grant.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                self.throttled.fetch_add(1, Ordering::Relaxed);
                trace!(wait = ?(ready_at - Instant::now()), "Rate limiter delaying request");
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    /// Total permits handed out
    #[must_use]
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    /// Permits that had to wait
    #[must_use]
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}
