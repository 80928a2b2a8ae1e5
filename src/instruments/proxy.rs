//! Timed instrument proxies.
//!
//! Each proxy implements the same capability trait as the device it wraps and
//! forwards every call to its [`InstrumentExecutor`] under a fixed command
//! label, so steps get leasing, timeouts, retries and the breaker without
//! knowing about any of them. The slot's cancellation token is bound at
//! construction.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::InstrumentError;
use crate::instruments::capabilities::{
    CommBus, HealthCheck, HealthStatus, Instrument, Multimeter, PowerSupply,
};
use crate::instruments::executor::{InstrumentExecutor, RecoveryAction};

pub const DMM_INITIALIZE: &str = "DMM.Initialize";
pub const DMM_MEASURE: &str = "DMM.Measure";
pub const PSU_INITIALIZE: &str = "PSU.Initialize";
pub const PSU_SET_OUTPUT: &str = "PSU.SetOutput";
pub const CAN_INITIALIZE: &str = "CAN.Initialize";
pub const CAN_SEND: &str = "CAN.Send";
pub const CAN_REINITIALIZE: &str = "CAN.Reinitialize";

// =============================================================================
// TimedDmm
// =============================================================================

pub struct TimedDmm {
    inner: Arc<dyn Multimeter>,
    executor: InstrumentExecutor,
    cancel: CancellationToken,
}

impl TimedDmm {
    pub fn new(inner: Arc<dyn Multimeter>, executor: InstrumentExecutor, cancel: CancellationToken) -> Self {
        Self {
            inner,
            executor,
            cancel,
        }
    }

    pub fn executor(&self) -> &InstrumentExecutor {
        &self.executor
    }
}

#[async_trait]
impl Instrument for TimedDmm {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initialize(&self) -> Result<()> {
        self.executor
            .execute(DMM_INITIALIZE, &self.cancel, || self.inner.initialize())
            .await?;
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        self.inner.health()
    }
}

#[async_trait]
impl Multimeter for TimedDmm {
    async fn measure_voltage(&self) -> Result<f64> {
        let volts = self
            .executor
            .execute(DMM_MEASURE, &self.cancel, || self.inner.measure_voltage())
            .await?;
        Ok(volts)
    }
}

#[async_trait]
impl HealthCheck for TimedDmm {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn check_health(&self) -> Result<HealthStatus> {
        Ok(self.inner.health())
    }
}

// =============================================================================
// TimedPsu
// =============================================================================

pub struct TimedPsu {
    inner: Arc<dyn PowerSupply>,
    executor: InstrumentExecutor,
    cancel: CancellationToken,
}

impl TimedPsu {
    pub fn new(inner: Arc<dyn PowerSupply>, executor: InstrumentExecutor, cancel: CancellationToken) -> Self {
        Self {
            inner,
            executor,
            cancel,
        }
    }

    pub fn executor(&self) -> &InstrumentExecutor {
        &self.executor
    }
}

#[async_trait]
impl Instrument for TimedPsu {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initialize(&self) -> Result<()> {
        self.executor
            .execute(PSU_INITIALIZE, &self.cancel, || self.inner.initialize())
            .await?;
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        self.inner.health()
    }
}

#[async_trait]
impl PowerSupply for TimedPsu {
    async fn set_output(&self, enabled: bool, voltage: f64, current_limit: f64) -> Result<()> {
        self.executor
            .execute(PSU_SET_OUTPUT, &self.cancel, || {
                self.inner.set_output(enabled, voltage, current_limit)
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for TimedPsu {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn check_health(&self) -> Result<HealthStatus> {
        Ok(self.inner.health())
    }
}

// =============================================================================
// TimedCanBus
// =============================================================================

pub struct TimedCanBus {
    inner: Arc<dyn CommBus>,
    executor: InstrumentExecutor,
    cancel: CancellationToken,
}

impl TimedCanBus {
    pub fn new(inner: Arc<dyn CommBus>, executor: InstrumentExecutor, cancel: CancellationToken) -> Self {
        Self {
            inner,
            executor,
            cancel,
        }
    }

    pub fn executor(&self) -> &InstrumentExecutor {
        &self.executor
    }
}

/// Reinitializes a latched bus between send attempts.
struct BusReinitialize<'a> {
    bus: &'a dyn CommBus,
}

#[async_trait]
impl<'a> RecoveryAction for BusReinitialize<'a> {
    fn command(&self) -> &str {
        CAN_REINITIALIZE
    }

    fn should_recover(&self, _error: &InstrumentError) -> bool {
        self.bus.needs_reinitialize()
    }

    async fn recover(&self) -> Result<()> {
        self.bus.reinitialize().await
    }
}

#[async_trait]
impl Instrument for TimedCanBus {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initialize(&self) -> Result<()> {
        self.executor
            .execute(CAN_INITIALIZE, &self.cancel, || self.inner.initialize())
            .await?;
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        self.inner.health()
    }
}

#[async_trait]
impl CommBus for TimedCanBus {
    async fn send(&self, payload: &str) -> Result<String> {
        let recovery = BusReinitialize {
            bus: self.inner.as_ref(),
        };
        let response = self
            .executor
            .execute_with_recovery(CAN_SEND, &self.cancel, || self.inner.send(payload), &recovery)
            .await?;
        Ok(response)
    }

    async fn reinitialize(&self) -> Result<()> {
        self.executor
            .execute(CAN_REINITIALIZE, &self.cancel, || self.inner.reinitialize())
            .await?;
        Ok(())
    }

    fn needs_reinitialize(&self) -> bool {
        self.inner.needs_reinitialize()
    }
}

#[async_trait]
impl HealthCheck for TimedCanBus {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn check_health(&self) -> Result<HealthStatus> {
        Ok(self.inner.health())
    }
}
