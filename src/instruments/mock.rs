//! Mock Instrument Implementations
//!
//! Provides simulated instruments for running a station without hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockDmm` - Multimeter returning 3.0..3.2 V readings from a seeded RNG
//! - `MockPsu` - Power supply that records its last output setting
//! - `MockCanBus` - Bus adapter answering `ACK:<payload>`, with scripted
//!   transient failures and an optional reinitialize-required latch
//!
//! # Performance Characteristics
//!
//! - MockDmm: 120ms per reading
//! - MockPsu: 100ms per command
//! - MockCanBus: 80ms per round trip
//! - Initialization: 50ms

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::defaults::{MOCK_CAN_LATENCY, MOCK_DMM_LATENCY, MOCK_INIT_LATENCY, MOCK_PSU_LATENCY};
use crate::error::InstrumentError;
use crate::instruments::capabilities::{CommBus, HealthStatus, Instrument, Multimeter, PowerSupply};

/// Simulated latencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockLatency {
    pub dmm: Duration,
    pub psu: Duration,
    pub can: Duration,
    pub init: Duration,
}

impl Default for MockLatency {
    fn default() -> Self {
        Self {
            dmm: MOCK_DMM_LATENCY,
            psu: MOCK_PSU_LATENCY,
            can: MOCK_CAN_LATENCY,
            init: MOCK_INIT_LATENCY,
        }
    }
}

/// Behaviour knobs for the simulated instrument set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockInstrumentOptions {
    /// Number of initial bus sends that go unacknowledged
    #[serde(default)]
    pub can_transient_failures: u32,
    /// Latch the bus into "needs reinitialization" after a failed send
    #[serde(default)]
    pub require_reinitialize_after_failure: bool,
    #[serde(skip)]
    pub latency: MockLatency,
}

impl Default for MockInstrumentOptions {
    fn default() -> Self {
        Self {
            can_transient_failures: 0,
            require_reinitialize_after_failure: false,
            latency: MockLatency::default(),
        }
    }
}

impl MockInstrumentOptions {
    /// Options with 1ms latencies, for tests
    pub fn fast() -> Self {
        let tick = Duration::from_millis(1);
        Self {
            latency: MockLatency {
                dmm: tick,
                psu: tick,
                can: tick,
                init: tick,
            },
            ..Self::default()
        }
    }

    pub fn with_can_failures(mut self, failures: u32, require_reinitialize: bool) -> Self {
        self.can_transient_failures = failures;
        self.require_reinitialize_after_failure = require_reinitialize;
        self
    }
}

// =============================================================================
// MockDmm - Simulated Multimeter
// =============================================================================

pub struct MockDmm {
    rng: Mutex<StdRng>,
    latency: Duration,
    init_latency: Duration,
}

impl MockDmm {
    pub const NAME: &'static str = "MockDmm";

    pub fn new(seed: u64) -> Self {
        Self::with_latency(seed, &MockLatency::default())
    }

    pub fn with_latency(seed: u64, latency: &MockLatency) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            latency: latency.dmm,
            init_latency: latency.init,
        }
    }
}

#[async_trait]
impl Instrument for MockDmm {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self) -> Result<()> {
        sleep(self.init_latency).await;
        Ok(())
    }
}

#[async_trait]
impl Multimeter for MockDmm {
    async fn measure_voltage(&self) -> Result<f64> {
        sleep(self.latency).await;
        let jitter: f64 = self.rng.lock().gen();
        Ok(3.0 + jitter * 0.2)
    }
}

// =============================================================================
// MockPsu - Simulated Power Supply
// =============================================================================

/// Last output setting applied to a [`MockPsu`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsuOutput {
    pub enabled: bool,
    pub voltage: f64,
    pub current_limit: f64,
}

pub struct MockPsu {
    output: Mutex<Option<PsuOutput>>,
    latency: Duration,
    init_latency: Duration,
}

impl MockPsu {
    pub const NAME: &'static str = "MockPsu";

    pub fn new() -> Self {
        Self::with_latency(&MockLatency::default())
    }

    pub fn with_latency(latency: &MockLatency) -> Self {
        Self {
            output: Mutex::new(None),
            latency: latency.psu,
            init_latency: latency.init,
        }
    }

    pub fn output(&self) -> Option<PsuOutput> {
        *self.output.lock()
    }
}

impl Default for MockPsu {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Instrument for MockPsu {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self) -> Result<()> {
        sleep(self.init_latency).await;
        Ok(())
    }
}

#[async_trait]
impl PowerSupply for MockPsu {
    async fn set_output(&self, enabled: bool, voltage: f64, current_limit: f64) -> Result<()> {
        if voltage < 0.0 || current_limit < 0.0 {
            return Err(anyhow!(
                "Invalid setpoint: {:.2} V / {:.2} A",
                voltage,
                current_limit
            ));
        }
        sleep(self.latency).await;
        *self.output.lock() = Some(PsuOutput {
            enabled,
            voltage,
            current_limit,
        });
        Ok(())
    }
}

// =============================================================================
// MockCanBus - Simulated Bus Adapter
// =============================================================================

#[derive(Debug, Default)]
struct BusState {
    remaining_failures: u32,
    needs_reinitialize: bool,
    reinitialize_count: u32,
    sent: Vec<String>,
}

pub struct MockCanBus {
    state: Mutex<BusState>,
    require_reinitialize: bool,
    latency: Duration,
    init_latency: Duration,
}

impl MockCanBus {
    pub const NAME: &'static str = "MockCan";

    pub fn new(options: &MockInstrumentOptions) -> Self {
        Self {
            state: Mutex::new(BusState {
                remaining_failures: options.can_transient_failures,
                ..BusState::default()
            }),
            require_reinitialize: options.require_reinitialize_after_failure,
            latency: options.latency.can,
            init_latency: options.latency.init,
        }
    }

    /// How many times `reinitialize` has completed
    pub fn reinitialize_count(&self) -> u32 {
        self.state.lock().reinitialize_count
    }

    /// Payloads that were acknowledged, in order
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Instrument for MockCanBus {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self) -> Result<()> {
        sleep(self.init_latency).await;
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        if self.state.lock().needs_reinitialize {
            HealthStatus::Degraded("bus requires reinitialization".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

#[async_trait]
impl CommBus for MockCanBus {
    async fn send(&self, payload: &str) -> Result<String> {
        sleep(self.latency).await;

        let mut state = self.state.lock();
        if state.needs_reinitialize {
            return Err(anyhow!("{} requires reinitialization", Self::NAME));
        }
        if state.remaining_failures > 0 {
            state.remaining_failures -= 1;
            if self.require_reinitialize {
                state.needs_reinitialize = true;
            }
            return Err(InstrumentError::Timeout {
                instrument: Self::NAME.to_string(),
                command: format!("send {}", payload),
                timeout: self.latency,
            }
            .into());
        }
        state.sent.push(payload.to_string());
        Ok(format!("ACK:{}", payload))
    }

    async fn reinitialize(&self) -> Result<()> {
        sleep(self.init_latency).await;
        let mut state = self.state.lock();
        state.needs_reinitialize = false;
        state.reinitialize_count += 1;
        Ok(())
    }

    fn needs_reinitialize(&self) -> bool {
        self.state.lock().needs_reinitialize
    }
}
