//! Retry and timeout policy for backend calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BackendError, Result, StackwrightError};

/// Default number of attempts per backend call.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default ceiling for a single backoff delay in seconds.
const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default deadline of a single backend call in seconds.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Deadline of a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    ///
    /// A server hint such as `Retry-After` replaces the computed delay. Either
    /// way the delay never exceeds `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &StackwrightError) -> Duration {
        if let Some(hint) = error.retry_delay() {
            return hint.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails terminally, or the attempt budget
    /// is spent. Every attempt is bounded by `call_timeout`; a timeout counts
    /// as a transient failure.
    ///
    /// # Errors
    ///
    /// Returns the first terminal error, or
    /// [`BackendError::RetriesExhausted`] wrapping the last transient one.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::Timeout {
                    operation: operation.to_string(),
                    after_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                }
                .into()),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if attempt >= attempts {
                return Err(match error {
                    StackwrightError::Backend(last) => BackendError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts,
                        last: Box::new(last),
                    }
                    .into(),
                    other => other,
                });
            }

            let delay = self.delay_for(attempt, &error);
            warn!("{operation} failed (attempt {attempt}/{attempts}): {error}; retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            debug!("Retrying {operation}");
        }
    }
}
