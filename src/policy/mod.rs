//! Fault-tolerance policy for instrument operations.
//!
//! An [`InstrumentPolicy`] belongs to exactly one instrument in one slot and
//! composes:
//! - [`CircuitBreaker`]: admission check before every attempt
//! - a timeout bound around each attempt
//! - [`RetryEngine`]: backoff between attempts
//! - an optional [`FailureHook`] run between a failed attempt and the next one
//!
//! # Attempt lifecycle
//!
//! The loop itself is [`RetryEngine::execute`]; the policy supplies the
//! per-attempt body and wraps the hook.
//!
//! ```text
//! cancelled? ──yes──> Cancelled
//!     │
//! breaker allows? ──no──> BreakerOpen (no device call, no attempt consumed)
//!     │
//! select { cancel, timeout(op) }
//!     ├── Ok        -> record_success, return
//!     ├── Cancelled -> return (never retried)
//!     └── Err/Timeout -> record_failure, log, last attempt? -> Exhausted
//!                                           else hook -> backoff -> next
//! ```

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerOptions};
pub use retry::{RetryEngine, RetryOptions};

use crate::error::{is_cancelled, InstrumentError};
use crate::logging::SlotLogger;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Recovery logic run after a failed attempt and before the next one.
///
/// Errors returned here are logged and never counted as instrument failures.
#[async_trait]
pub trait FailureHook: Send + Sync {
    async fn on_failure(
        &self,
        error: &InstrumentError,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Reports hook failures on the slot log instead of failing the call
struct LoggedHook<'a> {
    inner: &'a dyn FailureHook,
    logger: &'a SlotLogger,
    command: &'a str,
}

#[async_trait]
impl<'a> FailureHook for LoggedHook<'a> {
    async fn on_failure(
        &self,
        error: &InstrumentError,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self.inner.on_failure(error, cancel).await {
            Err(e) if !is_cancelled(&e) => {
                self.logger
                    .warn(format!("Recovery after {} failed: {:#}", self.command, e));
                Ok(())
            }
            other => other,
        }
    }
}

pub struct InstrumentPolicy {
    identity: String,
    retry: RetryEngine,
    breaker: CircuitBreaker,
    timeout: Duration,
    logger: SlotLogger,
}

impl InstrumentPolicy {
    pub fn new(
        identity: impl Into<String>,
        retry: RetryOptions,
        breaker: CircuitBreakerOptions,
        timeout: Duration,
        logger: SlotLogger,
    ) -> Self {
        Self {
            identity: identity.into(),
            retry: RetryEngine::new(retry),
            breaker: CircuitBreaker::new(breaker),
            timeout,
            logger,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryEngine {
        &self.retry
    }

    /// Run `op` under breaker, timeout and retry control.
    ///
    /// The attempt loop is [`RetryEngine::execute`]; each attempt checks the
    /// breaker, bounds `op` by the timeout and records the outcome.
    pub async fn execute<T, F, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        mut op: F,
        hook: Option<&dyn FailureHook>,
    ) -> Result<T, InstrumentError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let logged = hook.map(|inner| LoggedHook {
            inner,
            logger: &self.logger,
            command,
        });

        self.retry
            .execute(
                command,
                cancel,
                |attempt| {
                    let admitted = if self.breaker.allow_request() {
                        Some(op())
                    } else {
                        None
                    };
                    async move {
                        let Some(fut) = admitted else {
                            self.logger.warn(format!(
                                "Circuit open for {}; {} blocked",
                                self.identity, command
                            ));
                            return Err(InstrumentError::BreakerOpen {
                                instrument: self.identity.clone(),
                                command: command.to_string(),
                            });
                        };
                        match self.attempt(command, cancel, fut).await {
                            Ok(value) => {
                                self.breaker.record_success();
                                Ok(value)
                            }
                            Err(e) if e.is_cancellation() => Err(InstrumentError::Cancelled),
                            Err(e) => {
                                self.breaker.record_failure();
                                self.logger
                                    .warn(format!("Attempt {} failed: {}", attempt, e));
                                Err(e)
                            }
                        }
                    }
                },
                logged.as_ref().map(|h| h as &dyn FailureHook),
            )
            .await
    }

    /// One timed attempt with no retry and no breaker bookkeeping.
    ///
    /// Used for follow-up calls made while a lease is already held.
    pub async fn execute_once<T, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        fut: Fut,
    ) -> Result<T, InstrumentError>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(InstrumentError::Cancelled);
        }
        self.attempt(command, cancel, fut).await
    }

    async fn attempt<T, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        fut: Fut,
    ) -> Result<T, InstrumentError>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InstrumentError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, fut) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(InstrumentError::from_device(e)),
                Err(_) => Err(InstrumentError::Timeout {
                    instrument: self.identity.clone(),
                    command: command.to_string(),
                    timeout: self.timeout,
                }),
            },
        }
    }
}

impl std::fmt::Debug for InstrumentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentPolicy")
            .field("identity", &self.identity)
            .field("timeout", &self.timeout)
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}
