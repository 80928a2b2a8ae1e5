//! Lease-guarded execution of instrument operations.
//!
//! Every call follows the same path:
//!
//! ```text
//! acquire lease ─> InstrumentPolicy::execute ─> release lease ─> one log record
//!                        │
//!                        └─ between attempts: RecoveryAction via execute_with_lease
//! ```
//!
//! The record carries instrument identity, command, response or error text,
//! elapsed wall time and the slot/correlation ids.

use crate::error::InstrumentError;
use crate::instruments::lease::{InstrumentLease, LeaseManager};
use crate::logging::{LogLevel, SlotLogger};
use crate::policy::{FailureHook, InstrumentPolicy};
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A device follow-up run inside the lease window of a failed call.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Command label used in the log record
    fn command(&self) -> &str;

    /// Decide whether the failure warrants recovery
    fn should_recover(&self, _error: &InstrumentError) -> bool {
        true
    }

    async fn recover(&self) -> anyhow::Result<()>;
}

pub struct InstrumentExecutor {
    identity: String,
    policy: Arc<InstrumentPolicy>,
    leases: Arc<LeaseManager>,
    logger: SlotLogger,
}

impl InstrumentExecutor {
    pub fn new(policy: Arc<InstrumentPolicy>, leases: Arc<LeaseManager>, logger: SlotLogger) -> Self {
        Self {
            identity: policy.identity().to_string(),
            policy,
            leases,
            logger,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn policy(&self) -> &InstrumentPolicy {
        &self.policy
    }

    /// Acquire the lease and run `op` through the policy.
    pub async fn execute<T, F, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, InstrumentError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Debug + Send,
    {
        self.run(command, cancel, op, None).await
    }

    /// Like [`execute`](Self::execute), running `recovery` between attempts
    /// while the lease is still held.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        op: F,
        recovery: &dyn RecoveryAction,
    ) -> Result<T, InstrumentError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Debug + Send,
    {
        self.run(command, cancel, op, Some(recovery)).await
    }

    /// Run one timed call under a lease the caller already holds.
    pub async fn execute_with_lease<T, Fut>(
        &self,
        lease: &InstrumentLease,
        command: &str,
        cancel: &CancellationToken,
        fut: Fut,
    ) -> Result<T, InstrumentError>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Debug,
    {
        if lease.identity() != self.identity {
            return Err(InstrumentError::LeaseMismatch {
                held: lease.identity().to_string(),
                requested: self.identity.clone(),
            });
        }
        let started = Instant::now();
        let result = self.policy.execute_once(command, cancel, fut).await;
        self.record(command, &result, started.elapsed());
        result
    }

    async fn run<T, F, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        op: F,
        recovery: Option<&dyn RecoveryAction>,
    ) -> Result<T, InstrumentError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Debug + Send,
    {
        let started = Instant::now();
        let result = async {
            let lease = self.leases.acquire(&self.identity, cancel).await?;
            let hook = recovery.map(|action| LeaseRecovery {
                executor: self,
                lease: &lease,
                action,
            });
            self.policy
                .execute(
                    command,
                    cancel,
                    op,
                    hook.as_ref().map(|h| h as &dyn FailureHook),
                )
                .await
        }
        .await;
        self.record(command, &result, started.elapsed());
        result
    }

    fn record<T: Debug>(&self, command: &str, result: &Result<T, InstrumentError>, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let slot_id = self.logger.slot_id();
        let correlation_id = self.logger.correlation_id();
        match result {
            Ok(response) => {
                tracing::debug!(
                    instrument = %self.identity,
                    command,
                    elapsed_ms,
                    slot_id,
                    %correlation_id,
                    response = ?response,
                    "Instrument call completed"
                );
                self.logger.log(
                    LogLevel::Debug,
                    format!(
                        "{} {} -> {:?} ({} ms)",
                        self.identity, command, response, elapsed_ms
                    ),
                );
            }
            Err(error) => {
                let level = if error.is_cancellation() {
                    LogLevel::Debug
                } else {
                    LogLevel::Warning
                };
                tracing::debug!(
                    instrument = %self.identity,
                    command,
                    elapsed_ms,
                    slot_id,
                    %correlation_id,
                    error = %error,
                    "Instrument call failed"
                );
                self.logger.log(
                    level,
                    format!(
                        "{} {} failed: {} ({} ms)",
                        self.identity, command, error, elapsed_ms
                    ),
                );
            }
        }
    }
}

impl std::fmt::Debug for InstrumentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentExecutor")
            .field("identity", &self.identity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Adapts a [`RecoveryAction`] into a policy hook bound to a held lease.
struct LeaseRecovery<'a> {
    executor: &'a InstrumentExecutor,
    lease: &'a InstrumentLease,
    action: &'a dyn RecoveryAction,
}

#[async_trait]
impl<'a> FailureHook for LeaseRecovery<'a> {
    async fn on_failure(
        &self,
        error: &InstrumentError,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if !self.action.should_recover(error) {
            return Ok(());
        }
        self.executor
            .execute_with_lease(self.lease, self.action.command(), cancel, self.action.recover())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::policy::{CircuitBreakerOptions, RetryOptions};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn executor(identity: &str, leases: Arc<LeaseManager>) -> (InstrumentExecutor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = SlotLogger::new(sink.clone(), Uuid::new_v4(), 2);
        let policy = Arc::new(InstrumentPolicy::new(
            identity,
            RetryOptions::new(3, Duration::from_millis(1), false),
            CircuitBreakerOptions::new(5, Duration::from_secs(60)),
            Duration::from_secs(1),
            logger.clone(),
        ));
        (InstrumentExecutor::new(policy, leases, logger), sink)
    }

    #[tokio::test]
    async fn logs_one_record_per_call() {
        let (executor, sink) = executor("MockDmm", Arc::new(LeaseManager::new()));
        let value = executor
            .execute("DMM.Measure", &CancellationToken::new(), || async {
                Ok::<_, anyhow::Error>(3.1)
            })
            .await
            .unwrap();

        assert_eq!(value, 3.1);
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.starts_with("MockDmm DMM.Measure -> 3.1"));
        assert_eq!(entries[0].slot_id, 2);
    }

    #[tokio::test]
    async fn lease_held_for_whole_call() {
        let leases = Arc::new(LeaseManager::new());
        let (executor, _) = executor("MockPsu", leases.clone());
        let observed = executor
            .execute("PSU.SetOutput", &CancellationToken::new(), || {
                let leased = leases.is_leased("MockPsu");
                async move { Ok::<_, anyhow::Error>(leased) }
            })
            .await
            .unwrap();

        assert!(observed);
        assert!(!leases.is_leased("MockPsu"));
    }

    struct Reset(AtomicU32);

    #[async_trait]
    impl RecoveryAction for Reset {
        fn command(&self) -> &str {
            "CAN.Reinitialize"
        }

        async fn recover(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn recovery_runs_inside_lease_window() {
        let (executor, sink) = executor("MockCan", Arc::new(LeaseManager::new()));
        let reset = Reset(AtomicU32::new(0));
        let calls = AtomicU32::new(0);

        let response = executor
            .execute_with_recovery(
                "CAN.Send",
                &CancellationToken::new(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            anyhow::bail!("no acknowledgement")
                        }
                        Ok("ACK:PING".to_string())
                    }
                },
                &reset,
            )
            .await
            .unwrap();

        assert_eq!(response, "ACK:PING");
        assert_eq!(reset.0.load(Ordering::SeqCst), 1);
        assert!(sink.contains("CAN.Reinitialize"));
    }

    #[tokio::test]
    async fn foreign_lease_is_rejected() {
        let leases = Arc::new(LeaseManager::new());
        let (executor, _) = executor("MockCan", leases.clone());
        let lease = leases
            .acquire("MockDmm", &CancellationToken::new())
            .await
            .unwrap();

        let result = executor
            .execute_with_lease(&lease, "CAN.Reinitialize", &CancellationToken::new(), async {
                Ok::<_, anyhow::Error>(())
            })
            .await;
        assert!(matches!(result, Err(InstrumentError::LeaseMismatch { .. })));
    }
}
