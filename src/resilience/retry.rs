//! Retry with exponential backoff, shared by every external-call site.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RequestConfig;
use crate::error::Retryable;

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1)))
    }
}

impl From<&RequestConfig> for RetryPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.retry_delay_ms))
    }
}

/// Outcome of a retried operation that ultimately failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Last error seen
    pub last_error: E,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy
/// is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            warn!(
                operation = %operation,
                retry = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying external call"
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || attempt > policy.max_retries {
                    return Err(RetryExhausted {
                        last_error: e,
                        attempts: attempt,
                    });
                }
                warn!(operation = %operation, error = %e, attempt, "External call failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn provider_error() -> DataError {
        DataError::Provider {
            provider: "p".to_string(),
            message: "flaky".to_string(),
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let counter = &calls;
        let result = retry_with_backoff(policy, "test", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(provider_error())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let counter = &calls;
        let result: Result<(), _> = retry_with_backoff(policy, "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(provider_error())
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let counter = &calls;
        let result: Result<(), _> = retry_with_backoff(policy, "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DataError::NoData {
                key: "AAPL".to_string(),
            })
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
