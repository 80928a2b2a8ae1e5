//! Instrument Capabilities
//!
//! Fine-grained capability traits for the instruments a slot drives. Steps
//! only ever see these traits; whether the object behind them is a raw device
//! or a timed proxy is decided by the instrument manager.
//!
//! - A multimeter implements: `Instrument + Multimeter`
//! - A power supply implements: `Instrument + PowerSupply`
//! - A bus adapter implements: `Instrument + CommBus`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Device calls take no cancellation token. The policy layer aborts an
//! in-flight call by dropping its future, so implementations must not leave
//! the device half-configured across an `.await`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of a health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Capability: Identity and initialization
///
/// # Contract
/// - `name` is the stable instrument identity, used as the lease key
/// - `initialize` may be called more than once
/// - `health` reports device-tracked degradation; devices that track
///   nothing stay `Healthy`
#[async_trait]
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()>;

    fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Capability: Voltage measurement
#[async_trait]
pub trait Multimeter: Instrument {
    /// Read DC voltage in volts
    async fn measure_voltage(&self) -> Result<f64>;
}

/// Capability: Programmable supply output
#[async_trait]
pub trait PowerSupply: Instrument {
    /// Configure and switch the output
    ///
    /// # Arguments
    /// * `enabled` - Output on/off
    /// * `voltage` - Setpoint in volts
    /// * `current_limit` - Current limit in amps
    async fn set_output(&self, enabled: bool, voltage: f64, current_limit: f64) -> Result<()>;
}

/// Capability: Request/response bus traffic
///
/// # Contract
/// - `send` returns the device response
/// - After an unacknowledged send a device may require `reinitialize`
///   before further traffic succeeds; `needs_reinitialize` reports that
#[async_trait]
pub trait CommBus: Instrument {
    async fn send(&self, payload: &str) -> Result<String>;

    async fn reinitialize(&self) -> Result<()>;

    fn needs_reinitialize(&self) -> bool {
        false
    }
}

/// Capability: Health probing (used by the watchdog)
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check_health(&self) -> Result<HealthStatus>;
}

/// The instrument set exposed to step execution.
pub trait InstrumentServices: Send + Sync {
    fn dmm(&self) -> &dyn Multimeter;

    fn psu(&self) -> &dyn PowerSupply;

    fn can(&self) -> &dyn CommBus;

    /// Instrument identities, sorted ascending
    fn identities(&self) -> Vec<String> {
        let mut names = vec![
            self.dmm().name().to_string(),
            self.psu().name().to_string(),
            self.can().name().to_string(),
        ];
        names.sort();
        names
    }
}
