//! Retries with exponential backoff for transfers and composer calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Doubles with every retry
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Used in log lines
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome of [`retry_async`].
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    Failed { error: E, attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }

    /// Drop the attempt count.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::Failed { error, .. } => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, `config.max_retries` is exhausted, or
/// it fails with an error `retryable` rejects.
pub async fn retry_async<F, Fut, T, E, R>(config: &RetryConfig, retryable: R, operation: F) -> RetryResult<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) if attempt < config.max_retries && retryable(&e) => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(
                    operation = %config.operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return RetryResult::Failed {
                    error,
                    attempts: attempt + 1,
                }
            }
        }
    }
}

/// Rate-limits logging of a failure that repeats on every loop iteration.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > self.max_logged_failures {
            debug!(failures = self.consecutive_failures, "Recovered after suppressed failures");
        }
        self.consecutive_failures = 0;
    }

    /// Returns `true` if this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures == self.max_logged_failures + 1 {
            warn!(
                failures = self.max_logged_failures,
                "Suppressing further failure logs until recovery"
            );
        }
        self.consecutive_failures <= self.max_logged_failures
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
