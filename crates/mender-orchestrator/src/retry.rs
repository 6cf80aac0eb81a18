//! Retry with deterministic exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mender_core::{MenderConfig, MenderError, Result};

/// Backoff parameters, fixed once constructed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: backoff_factor.max(1.0),
        }
    }

    pub fn from_config(config: &MenderConfig) -> Self {
        Self::new(
            config.retry_attempts,
            config.retry.initial_delay(),
            config.retry.max_delay(),
            config.retry.backoff_factor,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay following `delay`, capped at the maximum
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.backoff_factor;
        if next >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(next)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

/// Runs an operation up to `max_attempts` times, sleeping between attempts
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `f` until it succeeds or attempts run out
    ///
    /// Backoff sleeps end early when `cancel` fires, yielding a cancellation
    /// error. Errors that are not retryable are returned as-is.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut delay = self.policy.initial_delay;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(MenderError::cancelled(operation));
            }

            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    debug!("{} failed with non-retryable error: {}", operation, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "{} failed on attempt {}/{}: {}",
                        operation, attempt, max_attempts, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                debug!("Retrying {} in {:?}", operation, delay);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(MenderError::cancelled(operation)),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = self.policy.next_delay(delay);
            }
        }

        Err(MenderError::RetryExhausted {
            operation: operation.to_string(),
            attempts: max_attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| MenderError::Other("no attempts made".to_string())),
            ),
        })
    }
}
