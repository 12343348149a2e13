//! Failure isolation for external calls.
//!
//! - [`CircuitBreaker`] / [`SharedBreaker`]: three-state breaker, one per dependency,
//!   with [`BreakerPermit`] settling each admitted call
//! - [`retry_with_backoff`]: bounded exponential-backoff retry
//! - [`RateLimiter`]: per-provider minimum call interval

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerSummary, CircuitState, SharedBreaker,
};
pub use rate_limit::RateLimiter;
pub use retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
