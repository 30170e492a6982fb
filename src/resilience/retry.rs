// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with optional exponential backoff.
//!
//! One policy type is applied uniformly around every adapter fetch and every
//! store write, so no call site carries its own copy of the retry logic.
//! Every policy is finite.
//!
//! # Example
//!
//! ```
//! use telemetry_sync::RetryPolicy;
//! use std::time::Duration;
//!
//! // Window fetch: one retry after a fixed pause
//! let fetch = RetryPolicy::fixed(2, Duration::from_secs(3));
//! assert_eq!(fetch.max_attempts, 2);
//!
//! // Startup: fail fast on bad connection strings
//! let startup = RetryPolicy::startup();
//! assert_eq!(startup.max_attempts, 5);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// `max_attempts` counts the first try, so `1` means "no retry".
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(2, Duration::from_secs(3))
    }
}

impl RetryPolicy {
    /// Constant delay between attempts.
    #[must_use]
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            factor: 1.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Store writes: short exponential backoff, capped at 2 seconds.
    #[must_use]
    pub fn store(max_attempts: usize) -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Retry `operation` on every error until the policy is exhausted.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, policy, operation, |_| true).await
}

/// Retry `operation` while `should_retry` accepts the error.
///
/// A rejected error is returned immediately without sleeping.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = policy.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if attempts >= policy.max_attempts || !should_retry(&err) {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, policy.max_attempts, err, delay
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        msg: String,
        transient: bool,
    }

    impl TestError {
        fn transient(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: true }
        }

        fn permanent(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: false }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.msg)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryPolicy::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryPolicy::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError::transient(&format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result: Result<i32, TestError> = retry(
            "test_op",
            &policy,
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::transient("always fail"))
                }
            },
        ).await;

        assert!(result.unwrap_err().msg.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry_if(
            "test_op",
            &RetryPolicy::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::permanent("malformed"))
                }
            },
            |e| e.transient,
        ).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_never_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let _: Result<(), TestError> = retry(
            "test_op",
            &RetryPolicy::fixed(0, Duration::from_millis(1)), // clamped to 1
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::transient("nope"))
                }
            },
        ).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fixed_delay_does_not_grow() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(3));
        assert_eq!(policy.next_delay(policy.initial_delay), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let policy = RetryPolicy::store(5);

        let mut delay = policy.initial_delay;
        assert_eq!(delay, Duration::from_millis(100));

        delay = policy.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(200));

        delay = policy.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: 5,
        };

        assert_eq!(policy.next_delay(policy.initial_delay), Duration::from_secs(5));
    }
}
