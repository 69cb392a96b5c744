// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff.
//!
//! Reads, connects and idempotent writes (durable batch apply, ledger release,
//! `XACK`) go through [`retry`]. The toggle path uses [`retry_if`] so only
//! transient failures are retried and a `Conflict` comes back at once.
//!
//! Toggle scripts and stream appends are not idempotent: a lost reply retried
//! underneath the caller would turn a successful write into a `Conflict` or a
//! duplicate event. Backends run those exactly once and leave the decision to
//! [`ToggleService`](crate::ToggleService).
//!
//! ```
//! use like_engine::RetryConfig;
//!
//! assert_eq!(RetryConfig::startup().max_attempts, 5);
//! assert_eq!(RetryConfig::query().max_attempts, 3);
//! assert_eq!(RetryConfig::toggle().max_attempts, 2);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Attempt budget and backoff curve for one kind of call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total calls, the first one included
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl RetryConfig {
    /// Connecting to Redis or SQL at startup. Gives up after roughly five
    /// seconds so a bad URL fails `connect` instead of hanging it.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single backend round trips issued by jobs and reads.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Opt-in retry for confirm/cancel (`retry_toggles`). The caller is waiting.
    #[must_use]
    pub fn toggle() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Retry every error until the budget runs out.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Like [`retry`], but returns at once on errors `should_retry` rejects.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= config.max_attempts || !should_retry(&err) => return Err(err),
            Err(err) => {
                warn!(
                    op = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %err,
                    ?delay,
                    "Backend call failed; retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LikeError;
    use crate::storage::traits::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flaky(fail_first: usize, calls: &AtomicUsize) -> Result<u32, LikeError> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= fail_first {
            Err(StorageError::Backend(format!("connection reset on call {}", n)).into())
        } else {
            Ok(7)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = retry("hget", &RetryConfig::query(), || async { flaky(2, &calls) }).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_counts_the_first_call() {
        let calls = AtomicUsize::new(0);
        let result = retry("hget", &RetryConfig::toggle(), || async { flaky(10, &calls) }).await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), LikeError> =
            retry_if("confirm", &RetryConfig::toggle(), LikeError::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LikeError::Conflict("already liked"))
            })
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig::toggle();
        let second = config.next_delay(config.initial_delay);
        assert_eq!(second, Duration::from_millis(100));
        assert_eq!(config.next_delay(second), Duration::from_millis(200));
        assert_eq!(config.next_delay(Duration::from_millis(200)), config.max_delay);
    }

    #[test]
    fn test_user_facing_budget_is_smallest() {
        let (startup, query, toggle) = (RetryConfig::startup(), RetryConfig::query(), RetryConfig::toggle());
        assert!(toggle.max_attempts < query.max_attempts && query.max_attempts < startup.max_attempts);
        assert!(toggle.max_delay < query.max_delay);
    }
}
