//! Instrument orchestration: capabilities, simulated devices, leasing,
//! policy-wrapped execution, timed proxies, health watchdog and the per-slot
//! manager that ties them together.

pub mod capabilities;
pub mod executor;
pub mod lease;
pub mod manager;
pub mod mock;
pub mod proxy;
pub mod watchdog;

pub use capabilities::{
    CommBus, HealthCheck, HealthStatus, Instrument, InstrumentServices, Multimeter, PowerSupply,
};
pub use executor::{InstrumentExecutor, RecoveryAction};
pub use lease::{InstrumentLease, LeaseManager};
pub use manager::{DeviceSet, InstrumentManager, InstrumentManagerConfig, InstrumentTimeouts};
pub use mock::{MockCanBus, MockDmm, MockInstrumentOptions, MockPsu};
pub use watchdog::{HealthCheckOptions, InstrumentWatchdog};
