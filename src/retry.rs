//! Bounded retry with exponential backoff for oracle calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// Upper bound on a single attempt; an attempt that runs over counts as unavailable.
    attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.retry.max_attempts)
            .with_backoff(
                Duration::from_millis(settings.retry.initial_backoff_ms),
                Duration::from_millis(settings.retry.max_backoff_ms),
            )
            .with_attempt_timeout(settings.oracle.request_timeout())
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (1-based) failed attempt: initial, 2x, 4x, ... capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` attempts have been made.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = match timeout(self.attempt_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::UpstreamUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.attempt_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(operation, attempt, error = %err, "Giving up");
                    return Err(err);
                }
            }
        }
    }
}
