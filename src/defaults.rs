//! Shared timing constants and fallback values.
//!
//! This module centralizes:
//! - Mock instrument latencies
//! - Shutdown and health-check timing
//! - Channel capacities

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Timeout for graceful shutdown of background tasks (2 seconds).
///
/// Used when stopping the instrument watchdog so a stuck health check can
/// never hold up slot teardown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between watchdog health probes (5 seconds).
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout applied to a single health probe (1 second).
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Mock Instrument Latencies
// =============================================================================

/// Simulated multimeter reading latency.
pub const MOCK_DMM_LATENCY: Duration = Duration::from_millis(120);
/// Simulated power supply command latency.
pub const MOCK_PSU_LATENCY: Duration = Duration::from_millis(100);
/// Simulated bus round-trip latency.
pub const MOCK_CAN_LATENCY: Duration = Duration::from_millis(80);
/// Simulated device initialization time.
pub const MOCK_INIT_LATENCY: Duration = Duration::from_millis(50);

// =============================================================================
// Channel Capacities
// =============================================================================

/// Capacity of the station event broadcast channel.
///
/// Lagging subscribers miss events; the run itself never waits on them.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
