//! Per-slot instrument assembly.
//!
//! An [`InstrumentManager`] owns everything one slot needs to talk to its
//! instruments: a policy per instrument kind, one shared [`LeaseManager`],
//! the timed proxies and, when enabled, a watchdog over their health checks.
//! Nothing here is shared between slots.

use crate::instruments::capabilities::{
    CommBus, HealthCheck, Instrument, InstrumentServices, Multimeter, PowerSupply,
};
use crate::instruments::executor::InstrumentExecutor;
use crate::instruments::lease::LeaseManager;
use crate::instruments::mock::{MockCanBus, MockDmm, MockInstrumentOptions, MockPsu};
use crate::instruments::proxy::{TimedCanBus, TimedDmm, TimedPsu};
use crate::instruments::watchdog::{HealthCheckOptions, InstrumentWatchdog};
use crate::logging::SlotLogger;
use crate::policy::{CircuitBreakerOptions, InstrumentPolicy, RetryOptions};
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-kind operation timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentTimeouts {
    #[serde(default = "default_dmm_timeout", with = "humantime_serde")]
    pub dmm: Duration,
    #[serde(default = "default_psu_timeout", with = "humantime_serde")]
    pub psu: Duration,
    #[serde(default = "default_can_timeout", with = "humantime_serde")]
    pub can: Duration,
}

fn default_dmm_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_psu_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_can_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for InstrumentTimeouts {
    fn default() -> Self {
        Self {
            dmm: default_dmm_timeout(),
            psu: default_psu_timeout(),
            can: default_can_timeout(),
        }
    }
}

/// Everything needed to assemble one slot's instruments
#[derive(Debug, Clone, Default)]
pub struct InstrumentManagerConfig {
    pub timeouts: InstrumentTimeouts,
    pub retry: RetryOptions,
    pub breaker: CircuitBreakerOptions,
    pub health: HealthCheckOptions,
    pub mocks: MockInstrumentOptions,
    /// Base seed; the multimeter's reading noise uses seed+1
    pub seed: u64,
}

/// Raw device handles wrapped by the manager
pub struct DeviceSet {
    pub dmm: Arc<dyn Multimeter>,
    pub psu: Arc<dyn PowerSupply>,
    pub can: Arc<dyn CommBus>,
}

impl DeviceSet {
    /// The simulated instrument set
    pub fn mock(options: &MockInstrumentOptions, seed: u64) -> Self {
        Self {
            dmm: Arc::new(MockDmm::with_latency(seed + 1, &options.latency)),
            psu: Arc::new(MockPsu::with_latency(&options.latency)),
            can: Arc::new(MockCanBus::new(options)),
        }
    }
}

pub struct InstrumentManager {
    dmm: Arc<TimedDmm>,
    psu: Arc<TimedPsu>,
    can: Arc<TimedCanBus>,
    leases: Arc<LeaseManager>,
    watchdog: Mutex<Option<InstrumentWatchdog>>,
}

impl InstrumentManager {
    /// Assemble a manager over the mock instrument set.
    pub fn new(
        config: &InstrumentManagerConfig,
        logger: SlotLogger,
        cancel: &CancellationToken,
    ) -> Self {
        let devices = DeviceSet::mock(&config.mocks, config.seed);
        Self::with_devices(devices, config, logger, cancel)
    }

    /// Assemble a manager over caller-supplied devices.
    ///
    /// Must be called from within a tokio runtime when the watchdog is enabled.
    pub fn with_devices(
        devices: DeviceSet,
        config: &InstrumentManagerConfig,
        logger: SlotLogger,
        cancel: &CancellationToken,
    ) -> Self {
        let leases = Arc::new(LeaseManager::new());

        let executor = |identity: &str, timeout: Duration| {
            let policy = Arc::new(InstrumentPolicy::new(
                identity,
                config.retry,
                config.breaker,
                timeout,
                logger.clone(),
            ));
            InstrumentExecutor::new(policy, leases.clone(), logger.clone())
        };

        let dmm = Arc::new(TimedDmm::new(
            devices.dmm.clone(),
            executor(devices.dmm.name(), config.timeouts.dmm),
            cancel.clone(),
        ));
        let psu = Arc::new(TimedPsu::new(
            devices.psu.clone(),
            executor(devices.psu.name(), config.timeouts.psu),
            cancel.clone(),
        ));
        let can = Arc::new(TimedCanBus::new(
            devices.can.clone(),
            executor(devices.can.name(), config.timeouts.can),
            cancel.clone(),
        ));

        let watchdog = config.health.enabled.then(|| {
            let checks: Vec<Arc<dyn HealthCheck>> = vec![dmm.clone(), psu.clone(), can.clone()];
            InstrumentWatchdog::start(checks, config.health, logger.clone(), cancel)
        });

        Self {
            dmm,
            psu,
            can,
            leases,
            watchdog: Mutex::new(watchdog),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn has_watchdog(&self) -> bool {
        self.watchdog.lock().is_some()
    }

    /// Initialize every instrument through its proxy.
    pub async fn initialize_all(&self) -> Result<()> {
        Instrument::initialize(self.dmm.as_ref()).await?;
        Instrument::initialize(self.psu.as_ref()).await?;
        Instrument::initialize(self.can.as_ref()).await?;
        Ok(())
    }

    /// Stop the watchdog. Device handles need no teardown.
    pub async fn shutdown(&self) {
        let watchdog = self.watchdog.lock().take();
        if let Some(mut watchdog) = watchdog {
            watchdog.shutdown().await;
        }
    }
}

impl InstrumentServices for InstrumentManager {
    fn dmm(&self) -> &dyn Multimeter {
        self.dmm.as_ref()
    }

    fn psu(&self) -> &dyn PowerSupply {
        self.psu.as_ref()
    }

    fn can(&self) -> &dyn CommBus {
        self.can.as_ref()
    }
}

impl std::fmt::Debug for InstrumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentManager")
            .field("identities", &self.identities())
            .field("watchdog", &self.has_watchdog())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exposes_sorted_identities() {
        let config = InstrumentManagerConfig {
            health: HealthCheckOptions::disabled(),
            mocks: MockInstrumentOptions::fast(),
            ..Default::default()
        };
        let manager =
            InstrumentManager::new(&config, SlotLogger::detached(), &CancellationToken::new());
        assert_eq!(manager.identities(), vec!["MockCan", "MockDmm", "MockPsu"]);
        assert!(!manager.has_watchdog());
        manager.initialize_all().await.unwrap();
    }

    #[tokio::test]
    async fn watchdog_started_when_enabled_and_stopped_on_shutdown() {
        let config = InstrumentManagerConfig {
            health: HealthCheckOptions::new(Duration::from_millis(10), Duration::from_millis(10)),
            mocks: MockInstrumentOptions::fast(),
            ..Default::default()
        };
        let manager =
            InstrumentManager::new(&config, SlotLogger::detached(), &CancellationToken::new());
        assert!(manager.has_watchdog());
        manager.shutdown().await;
        assert!(!manager.has_watchdog());
    }
}
