//! Background health polling for a slot's instruments.
//!
//! The watchdog ticks every `interval`, probing each registered
//! [`HealthCheck`] under its own `timeout`. Errors, timeouts and degraded
//! results are logged as warnings; none of them stop the loop. Shutdown
//! cancels the loop and waits at most [`SHUTDOWN_TIMEOUT`] for it to finish.

use crate::defaults::{HEALTH_CHECK_INTERVAL, HEALTH_CHECK_TIMEOUT, SHUTDOWN_TIMEOUT};
use crate::instruments::capabilities::{HealthCheck, HealthStatus};
use crate::logging::SlotLogger;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for the instrument watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckOptions {
    /// Whether a watchdog is started for each slot
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Time between probe rounds
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Bound on a single probe
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> Duration {
    HEALTH_CHECK_INTERVAL
}

fn default_timeout() -> Duration {
    HEALTH_CHECK_TIMEOUT
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_interval(),
            timeout: default_timeout(),
        }
    }
}

impl HealthCheckOptions {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            timeout,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

type StatusMap = Arc<RwLock<HashMap<String, HealthStatus>>>;

pub struct InstrumentWatchdog {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    statuses: StatusMap,
    rounds: Arc<AtomicU64>,
}

impl InstrumentWatchdog {
    /// Spawn the polling loop. It stops when `parent` or the watchdog's own
    /// token is cancelled.
    pub fn start(
        checks: Vec<Arc<dyn HealthCheck>>,
        options: HealthCheckOptions,
        logger: SlotLogger,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let statuses: StatusMap = Arc::new(RwLock::new(HashMap::new()));
        let rounds = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(poll_loop(
            checks,
            options,
            logger,
            cancel.clone(),
            statuses.clone(),
            rounds.clone(),
        ));

        Self {
            cancel,
            handle: Some(handle),
            statuses,
            rounds,
        }
    }

    /// Last observed status per instrument
    pub fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().clone()
    }

    /// Completed probe rounds
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for it, bounded by [`SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::warn!("Instrument watchdog task failed: {}", e),
            Err(_) => {
                tracing::warn!("Instrument watchdog did not stop within {:?}", SHUTDOWN_TIMEOUT);
                handle.abort();
            }
        }
    }
}

impl Drop for InstrumentWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    checks: Vec<Arc<dyn HealthCheck>>,
    options: HealthCheckOptions,
    logger: SlotLogger,
    cancel: CancellationToken,
    statuses: StatusMap,
    rounds: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(options.interval) => {}
        }

        for check in &checks {
            let probe = tokio::time::timeout(options.timeout, check.check_health());
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                outcome = probe => outcome,
            };

            let name = check.name().to_string();
            let status = match outcome {
                Ok(Ok(HealthStatus::Healthy)) => HealthStatus::Healthy,
                Ok(Ok(HealthStatus::Degraded(reason))) => {
                    logger.warn(format!("Health check {} degraded: {}", name, reason));
                    HealthStatus::Degraded(reason)
                }
                Ok(Err(e)) => {
                    logger.warn(format!("Health check {} failed: {:#}", name, e));
                    HealthStatus::Degraded(e.to_string())
                }
                Err(_) => {
                    logger.warn(format!(
                        "Health check {} timed out after {:?}",
                        name, options.timeout
                    ));
                    HealthStatus::Degraded("health check timed out".to_string())
                }
            };
            statuses.write().insert(name, status);
        }

        rounds.fetch_add(1, Ordering::Relaxed);
    }
}
