//! Retry with exponential backoff for provider calls.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default maximum retry attempts for transient errors.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 2;

/// Default base delay for exponential backoff in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Default maximum delay for exponential backoff in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 1000;

/// Default backoff multiplier (2.0 for exponential backoff).
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry policy for transient provider failures.
///
/// Only [`PipelineError::TransientProvider`] is retried; every other error is
/// returned immediately. Defaults are short because the user is waiting on
/// the other end of a live call.
///
/// # Examples
///
/// ```
/// use humphrey::services::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 2);
/// assert_eq!(policy.base_delay_ms, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, 1 = one retry, etc.).
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (caps exponential growth).
    pub max_delay_ms: u64,
    /// Backoff multiplier (2.0 for exponential backoff).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().with_max_attempts(0)
    }

    /// Set the maximum number of retry attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay in milliseconds.
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set the maximum delay in milliseconds.
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Calculate the delay for a given retry attempt with exponential backoff and jitter.
    ///
    /// Formula: min(base * multiplier^(attempt-1), max_delay) + jitter
    /// where jitter is a random value between 0 and 10% of the delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let exp = self
            .backoff_multiplier
            .powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
        let delay = (base * exp).min(max);

        let jitter = delay * (rand::random::<f64>() * 0.1);
        Duration::from_millis((delay + jitter) as u64)
    }

    /// Run `op`, retrying transient provider errors.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => self.backoff(what, &mut attempt, e).await?,
            }
        }
    }

    /// Sleep before the next attempt, or hand `err` back if it may not be retried.
    ///
    /// For call sites that cannot express the operation as a closure, such as
    /// a provider borrowed mutably across attempts. `attempt` starts at zero
    /// and is advanced here.
    ///
    /// # Errors
    ///
    /// Returns `err` when it is not transient or `attempt` reached the limit.
    pub async fn backoff(&self, what: &str, attempt: &mut u32, err: PipelineError) -> Result<()> {
        if !matches!(err, PipelineError::TransientProvider { .. })
            || *attempt >= self.max_attempts
        {
            return Err(err);
        }
        *attempt += 1;
        let delay = self.delay_for_attempt(*attempt);
        warn!(%what, attempt = *attempt, ?delay, "transient failure, retrying: {err}");
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
