//! Attempt/backoff loop.
//!
//! `RetryEngine` runs an operation up to `max_attempts` times, sleeping
//! `delay` (or `delay * 2^(attempt-1)` with exponential backoff) between
//! attempts. Cancellation is never retried and every sleep races the caller's
//! token. [`InstrumentPolicy`](super::InstrumentPolicy) drives every
//! instrument call through [`RetryEngine::execute`].

use super::FailureHook;
use crate::error::{is_cancelled, InstrumentError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Total attempts including the first one (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,
    /// Double the delay after every failed attempt
    #[serde(default = "default_exponential")]
    pub exponential_backoff: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_exponential() -> bool {
    true
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_delay(),
            exponential_backoff: default_exponential(),
        }
    }
}

impl RetryOptions {
    pub fn new(max_attempts: u32, delay: Duration, exponential_backoff: bool) -> Self {
        Self {
            max_attempts,
            delay,
            exponential_backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryEngine {
    options: RetryOptions,
}

impl RetryEngine {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options: RetryOptions {
                max_attempts: options.max_attempts.max(1),
                ..options
            },
        }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.options.exponential_backoff {
            return self.options.delay;
        }
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.options.delay.saturating_mul(factor)
    }

    /// Sleep after a failed attempt, returning early on cancellation.
    pub async fn backoff(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), InstrumentError> {
        let delay = self.delay_for(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InstrumentError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Only device failures and
    /// timeouts are retried; any other error ends the loop as is. `hook`
    /// runs after every retryable failure that still has an attempt left.
    /// On exhaustion the last error is returned wrapped in
    /// [`InstrumentError::Exhausted`].
    pub async fn execute<T, F, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        mut op: F,
        hook: Option<&dyn FailureHook>,
    ) -> Result<T, InstrumentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InstrumentError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(InstrumentError::Cancelled);
            }

            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancellation() => return Err(InstrumentError::Cancelled),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.options.max_attempts {
                return Err(InstrumentError::Exhausted {
                    command: command.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            if let Some(hook) = hook {
                if let Err(e) = hook.on_failure(&error, cancel).await {
                    if is_cancelled(&e) {
                        return Err(InstrumentError::Cancelled);
                    }
                    tracing::warn!(command, attempt, "Recovery failed: {:#}", e);
                }
            }

            tracing::debug!(command, attempt, "Retrying after: {}", error);
            self.backoff(attempt, cancel).await?;
        }
    }
}
