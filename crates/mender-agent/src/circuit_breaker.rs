//! Circuit breaker for collaborator failure protection
//!
//! Implements the circuit breaker pattern to stop hammering a fix generator or
//! hosting API that keeps failing. One breaker is shared by every worker.

use parking_lot::RwLock;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use mender_core::config::CircuitBreakerConfig;
use mender_core::{MenderError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Too many failures - reject requests immediately
    Open,
    /// Testing recovery - a single trial request decides
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every state change
    generation: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.trial_in_flight = false;
    }
}

/// Ticket for a call let through by [`CircuitBreaker::execute`]
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Circuit breaker to prevent cascading failures
///
/// # States
///
/// - **Closed**: all requests allowed; a success resets the failure count and
///   reaching `threshold` consecutive failures opens the circuit
/// - **Open**: requests rejected until `recovery_timeout` has passed since the
///   last failure, then the triggering request moves it to half-open
/// - **HalfOpen**: one trial request allowed and others rejected; success
///   closes, failure reopens
///
/// A call only affects the state it was admitted in. Results of calls that
/// were admitted before the last state change are ignored, so only the trial
/// decides how a half-open circuit leaves that state.
///
/// Failures further apart than `reset_timeout` do not accumulate while the
/// circuit is closed: a failure arriving more than `reset_timeout` after the
/// previous one restarts the count at one. Set `reset_timeout` above the
/// expected failure spacing to count every consecutive failure.
///
/// # Example
///
/// ```
/// use mender_agent::{CircuitBreaker, CircuitState};
/// use std::time::Duration;
///
/// let cb = CircuitBreaker::new(3, Duration::from_secs(30), Duration::from_secs(60));
///
/// cb.record_failure("analyze");
/// cb.record_failure("analyze");
/// cb.record_failure("analyze");
///
/// assert_eq!(cb.state(), CircuitState::Open);
/// assert!(!cb.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    threshold: u32,
    recovery_timeout: Duration,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Arguments
    ///
    /// * `threshold` - Number of consecutive failures before opening circuit
    /// * `recovery_timeout` - Time to wait before attempting recovery (half-open state)
    /// * `reset_timeout` - Gap after which the closed-state failure count starts over
    pub fn new(threshold: u32, recovery_timeout: Duration, reset_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
                generation: 0,
            }),
            threshold: threshold.max(1),
            recovery_timeout,
            reset_timeout,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.recovery_timeout(),
            config.reset_timeout(),
        )
    }

    /// Run `f` through the breaker
    ///
    /// Rejected calls never invoke `f`. Cancellation errors are passed
    /// through without being counted as failures.
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(admission) = self.try_acquire() else {
            return Err(MenderError::CircuitOpen {
                operation: operation.to_string(),
            });
        };

        let result = f().await;

        let mut inner = self.inner.write();
        if inner.generation != admission.generation {
            debug!(
                "Circuit breaker ignoring result for {} admitted before the last state change",
                operation
            );
            return result;
        }
        match &result {
            Ok(_) => self.on_success(&mut inner, operation, admission.trial),
            Err(e) if e.is_cancellation() => {
                if admission.trial {
                    inner.trial_in_flight = false;
                }
                debug!("Circuit breaker ignoring cancellation for {}", operation)
            }
            Err(_) => self.on_failure(&mut inner, operation, admission.trial),
        }
        drop(inner);
        result
    }

    /// Current state, without triggering the open -> half-open transition
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Check if a request would be let through right now
    pub fn can_execute(&self) -> bool {
        let inner = self.inner.read();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_elapsed(&inner),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Admit a request, claiming the trial slot when recovering
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here, so the caller's request becomes the trial.
    fn try_acquire(&self) -> Option<Admission> {
        {
            let inner = self.inner.read();
            if inner.state == CircuitState::Closed {
                return Some(Admission {
                    generation: inner.generation,
                    trial: false,
                });
            }
        }

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => Some(Admission {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::Open if self.recovery_elapsed(&inner) => {
                inner.transition(CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                info!("Circuit breaker transitioning to HALF_OPEN");
                Some(Admission {
                    generation: inner.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Some(Admission {
                    generation: inner.generation,
                    trial: true,
                })
            }
            CircuitState::Open | CircuitState::HalfOpen => None,
        }
    }

    /// Record a successful operation that did not run through [`execute`](Self::execute)
    ///
    /// Never moves a half-open circuit; only the trial does that.
    pub fn record_success(&self, operation: &str) {
        let mut inner = self.inner.write();
        self.on_success(&mut inner, operation, false);
    }

    /// Record a failed operation that did not run through [`execute`](Self::execute)
    ///
    /// Never moves a half-open circuit; only the trial does that.
    pub fn record_failure(&self, operation: &str) {
        let mut inner = self.inner.write();
        self.on_failure(&mut inner, operation, false);
    }

    fn on_success(&self, inner: &mut Inner, operation: &str, trial: bool) {
        debug!("Circuit breaker recorded success for {}", operation);

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.transition(CircuitState::Closed);
                inner.failure_count = 0;
                info!(
                    "Circuit breaker CLOSED for {} after successful operation",
                    operation
                );
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, operation: &str, trial: bool) {
        if inner.state == CircuitState::HalfOpen && !trial {
            debug!(
                "Circuit breaker ignoring failure for {} while HALF_OPEN",
                operation
            );
            return;
        }

        let now = Instant::now();
        if inner.state == CircuitState::Closed {
            if let Some(last) = inner.last_failure {
                if now.duration_since(last) > self.reset_timeout {
                    inner.failure_count = 0;
                }
            }
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);
        debug!(
            "Circuit breaker recorded failure for {} (failures: {})",
            operation, inner.failure_count
        );

        match inner.state {
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                warn!("Circuit breaker returned to OPEN state for {}", operation);
            }
            CircuitState::Closed if inner.failure_count >= self.threshold => {
                inner.transition(CircuitState::Open);
                warn!(
                    "Circuit breaker OPENED for {} after {} failures",
                    operation, inner.failure_count
                );
            }
            _ => {}
        }
    }

    /// Get current failure count (for monitoring)
    pub fn failure_count(&self) -> u32 {
        self.inner.read().failure_count
    }

    /// Time until an open circuit lets a trial through, zero otherwise
    pub fn time_until_retry(&self) -> Duration {
        let inner = self.inner.read();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(last)) => {
                self.recovery_timeout.saturating_sub(last.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    /// Force the circuit closed and forget past failures
    ///
    /// Calls still in flight from before the reset no longer count.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.transition(CircuitState::Closed);
        inner.failure_count = 0;
        inner.last_failure = None;
        info!("Circuit breaker manually reset to CLOSED");
    }

    fn recovery_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .map_or(true, |last| last.elapsed() > self.recovery_timeout)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(&CircuitBreakerConfig::default())
    }
}
