//! Circuit breaker guarding calls to unreliable dependencies.
//!
//! One breaker instance exists per external dependency (market data, LLM
//! debate calls) for the lifetime of the process. The breaker knows nothing
//! about what it protects. Callers take a [`BreakerPermit`] from
//! [`SharedBreaker::try_acquire`] before a call and settle it afterwards; a
//! permit dropped unsettled (a cancelled call) counts as a failure.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls are allowed
//! - **Open**: Blocking all calls until the recovery timeout elapses
//! - **Half-Open**: Allowing a bounded number of trial calls

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Blocking all calls - too many failures
    Open,
    /// Testing recovery - allowing trial calls
    HalfOpen,
}

impl CircuitState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            _ => Err(format!("Unknown circuit state: {}", s)),
        }
    }
}

/// Three-state failure isolation primitive.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    /// Current state
    state: CircuitState,

    /// Consecutive failures while closed (decays on success)
    failure_count: u32,

    /// Monotonic time of the last failure, drives recovery
    last_failure: Option<Instant>,

    /// Wall-clock time of the last failure, for display
    last_failure_at: Option<DateTime<Utc>>,

    /// Trial calls handed out since entering half-open
    half_open_calls: u32,

    /// When the current half-open window started
    half_open_since: Option<Instant>,

    /// Time of last state change
    last_state_change: DateTime<Utc>,

    /// Configuration
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_at: None,
            half_open_calls: 0,
            half_open_since: None,
            last_state_change: Utc::now(),
            config,
        }
    }

    /// Check if a call may proceed.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and the current call becomes the first trial. A half-open window whose
    /// trials never reported back within the recovery timeout is re-armed.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout())
                    .unwrap_or(true);
                if recovered {
                    self.transition_to(CircuitState::HalfOpen);
                    self.half_open_calls = 1;
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    return true;
                }
                let stalled = self
                    .half_open_since
                    .map(|at| at.elapsed() >= self.config.recovery_timeout())
                    .unwrap_or(true);
                if stalled {
                    tracing::warn!(
                        trials = self.half_open_calls,
                        "Half-open trials never reported back, re-arming"
                    );
                    self.half_open_calls = 1;
                    self.half_open_since = Some(Instant::now());
                    return true;
                }
                false
            }
        }
    }

    /// Hand back a trial whose outcome says nothing about the dependency.
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.transition_to(CircuitState::Closed);
            }
            CircuitState::Closed => {
                // Partial credit: a flaky dependency drifts back instead of resetting
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {
                tracing::debug!("Success recorded while circuit is open - ignoring");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Failed during recovery - go back to open
                self.failure_count += 1;
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Transition to a new state.
    fn transition_to(&mut self, new_state: CircuitState) {
        tracing::info!(
            from = %self.state,
            to = %new_state,
            failure_count = self.failure_count,
            "Circuit breaker state transition"
        );
        self.state = new_state;
        self.half_open_calls = 0;
        self.half_open_since = (new_state == CircuitState::HalfOpen).then(Instant::now);
        self.last_state_change = Utc::now();
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Get the failure counter.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Trial calls handed out in the current half-open window.
    pub fn half_open_calls(&self) -> u32 {
        self.half_open_calls
    }

    /// Get last failure time.
    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if the circuit is open (blocking calls).
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Check if the circuit is closed (allowing calls).
    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }

    /// Get time until recovery attempt (if open).
    pub fn time_until_recovery(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }

        let timeout = self.config.recovery_timeout();
        Some(
            self.last_failure
                .map(|at| timeout.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Force the breaker open as if the threshold had just been reached.
    pub fn force_open(&mut self) {
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
        self.failure_count = self.failure_count.max(self.config.failure_threshold);
        self.transition_to(CircuitState::Open);
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&mut self) {
        tracing::info!(
            from = %self.state,
            "Circuit breaker manually reset to closed"
        );
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_calls = 0;
        self.half_open_since = None;
        self.last_state_change = Utc::now();
    }

    /// Get a summary of the current state for display.
    pub fn summary(&self) -> CircuitBreakerSummary {
        CircuitBreakerSummary {
            state: self.state,
            failure_count: self.failure_count,
            time_until_recovery_ms: self.time_until_recovery().map(|d| d.as_millis() as u64),
            last_failure_at: self.last_failure_at,
            last_state_change: self.last_state_change,
        }
    }
}

/// Summary of circuit breaker state for display.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSummary {
    /// Current state
    pub state: CircuitState,
    /// Failure counter
    pub failure_count: u32,
    /// Time until recovery attempt (if open)
    pub time_until_recovery_ms: Option<u64>,
    /// Time of last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time of last state change
    pub last_state_change: DateTime<Utc>,
}

impl std::fmt::Display for CircuitBreakerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit Breaker: {} ", self.state.to_string().to_uppercase())?;

        match self.state {
            CircuitState::Closed => write!(f, "({} failures)", self.failure_count),
            CircuitState::Open => match self.time_until_recovery_ms {
                Some(ms) if ms >= 1000 => write!(f, "(recovery in {}s)", ms / 1000),
                Some(ms) => write!(f, "(recovery in {}ms)", ms),
                None => write!(f, "(recovering soon)"),
            },
            CircuitState::HalfOpen => write!(f, "(trial calls in progress)"),
        }
    }
}

/// A named breaker shared across concurrent queries.
///
/// All state mutation happens under one mutex, so concurrent
/// `record_failure` calls never lose updates.
#[derive(Debug, Clone)]
pub struct SharedBreaker {
    name: Arc<str>,
    inner: Arc<Mutex<CircuitBreaker>>,
}

impl SharedBreaker {
    /// Create a named breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(CircuitBreaker::new(config))),
        }
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// See [`CircuitBreaker::can_execute`].
    pub fn can_execute(&self) -> bool {
        self.inner.lock().can_execute()
    }

    /// Admit one call, or `None` while the breaker refuses calls.
    pub fn try_acquire(&self) -> Option<BreakerPermit> {
        self.can_execute().then(|| BreakerPermit {
            breaker: self.clone(),
            settled: false,
        })
    }

    /// See [`CircuitBreaker::release_trial`].
    pub fn release_trial(&self) {
        self.inner.lock().release_trial();
    }

    /// See [`CircuitBreaker::record_success`].
    pub fn record_success(&self) {
        self.inner.lock().record_success();
    }

    /// See [`CircuitBreaker::record_failure`].
    pub fn record_failure(&self) {
        let mut breaker = self.inner.lock();
        breaker.record_failure();
        if breaker.is_open() {
            tracing::warn!(
                breaker = %self.name,
                failure_count = breaker.failure_count(),
                "Circuit breaker open"
            );
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state()
    }

    /// Current failure counter.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count()
    }

    /// Force the breaker open.
    pub fn force_open(&self) {
        self.inner.lock().force_open();
    }

    /// Reset to closed.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Snapshot for display.
    pub fn summary(&self) -> CircuitBreakerSummary {
        self.inner.lock().summary()
    }
}

/// One call admitted by a [`SharedBreaker`].
///
/// Settle it with [`success`](Self::success), [`failure`](Self::failure) or
/// [`release`](Self::release). Dropping it unsettled records a failure, so a
/// call cancelled mid-flight never strands a half-open trial.
#[derive(Debug)]
#[must_use = "an unsettled permit records a failure when dropped"]
pub struct BreakerPermit {
    breaker: SharedBreaker,
    settled: bool,
}

impl BreakerPermit {
    /// The call succeeded.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// The call failed.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    /// The call was not a test of the dependency (bad input, unsupported).
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.release_trial();
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name(), "Call abandoned, recording failure");
            self.breaker.record_failure();
        }
    }
}
