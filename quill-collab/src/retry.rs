//! Bounded exponential backoff for store calls.
//!
//! An operation is attempted once and then retried up to
//! [`RetryPolicy::retries`] times, sleeping `base_delay * 2^n` before retry
//! `n`. Errors that are not retryable (permission, conflict, malformed data)
//! fail immediately.

use std::future::Future;
use std::time::Duration;

use crate::store::StoreError;

/// Retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles for each later one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}

/// Errors that know whether retrying can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }
}

/// Run `op` under `policy`, logging each failed attempt.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.retries => {
                log::error!("{operation} failed after {} attempts: {e}", attempt + 1);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "{operation} failed (attempt {}/{}), retrying in {delay:?}: {e}",
                    attempt + 1,
                    policy.retries + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 2);
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<u32, StoreError> = with_retry(RetryPolicy::default(), "append", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(StoreError::Unavailable("down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600) && elapsed < Duration::from_millis(650));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let calls = Cell::new(0);
        let result: Result<(), StoreError> = with_retry(RetryPolicy::default(), "append", || {
            calls.set(calls.get() + 1);
            async { Err(StoreError::Unavailable("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_error_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), StoreError> = with_retry(RetryPolicy::default(), "fetch", || {
            calls.set(calls.get() + 1);
            async { Err(StoreError::PermissionDenied("rls".into())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::PermissionDenied(_))));
        assert_eq!(calls.get(), 1);
    }
}
