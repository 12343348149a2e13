//! Per-provider minimum call interval.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between calls to one provider.
///
/// Callers that arrive early sleep rather than exceed the quota. Each
/// provider owns its own limiter; there is no global limiter.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the given minimum interval.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Configured interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a call is allowed, then claim the slot.
    ///
    /// Returns how long the caller slept.
    pub async fn acquire(&self) -> Duration {
        let mut last = self.last_call.lock().await;
        let mut waited = Duration::ZERO;

        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < self.min_interval {
                waited = self.min_interval - since;
                tracing::debug!(wait_ms = waited.as_millis() as u64, "Rate limit wait");
                tokio::time::sleep(waited).await;
            }
        }

        *last = Some(Instant::now());
        waited
    }
}
