//! Integration tests for the per-slot instrument manager.

use rust_station::error::InstrumentError;
use rust_station::instruments::{
    CommBus, DeviceSet, HealthCheckOptions, InstrumentManager, InstrumentManagerConfig,
    InstrumentServices, MockCanBus, MockDmm, MockInstrumentOptions, MockPsu, Multimeter,
    PowerSupply,
};
use rust_station::logging::{MemorySink, SlotLogger};
use rust_station::policy::{CircuitBreakerOptions, RetryOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn test_config(mocks: MockInstrumentOptions) -> InstrumentManagerConfig {
    InstrumentManagerConfig {
        retry: RetryOptions::new(3, Duration::from_millis(1), false),
        breaker: CircuitBreakerOptions::new(5, Duration::from_secs(60)),
        health: HealthCheckOptions::disabled(),
        mocks,
        seed: 7,
        ..Default::default()
    }
}

#[tokio::test]
async fn bus_recovers_after_transient_failure_with_reinitialize() {
    let mocks = MockInstrumentOptions::fast().with_can_failures(1, true);
    let config = test_config(mocks.clone());
    let bus = Arc::new(MockCanBus::new(&mocks));
    let devices = DeviceSet {
        dmm: Arc::new(MockDmm::with_latency(8, &mocks.latency)),
        psu: Arc::new(MockPsu::with_latency(&mocks.latency)),
        can: bus.clone(),
    };

    let sink = Arc::new(MemorySink::new());
    let logger = SlotLogger::new(sink.clone(), Uuid::new_v4(), 1);
    let manager =
        InstrumentManager::with_devices(devices, &config, logger, &CancellationToken::new());
    manager.initialize_all().await.unwrap();

    let response = manager.can().send("PING").await.unwrap();
    assert_eq!(response, "ACK:PING");
    assert_eq!(bus.reinitialize_count(), 1);
    assert_eq!(bus.sent(), vec!["PING"]);
    assert!(sink.contains("Attempt 1 failed"));
}

#[tokio::test]
async fn bus_without_latch_needs_no_reinitialize() {
    let mocks = MockInstrumentOptions::fast().with_can_failures(2, false);
    let config = test_config(mocks.clone());
    let bus = Arc::new(MockCanBus::new(&mocks));
    let devices = DeviceSet {
        dmm: Arc::new(MockDmm::with_latency(8, &mocks.latency)),
        psu: Arc::new(MockPsu::with_latency(&mocks.latency)),
        can: bus.clone(),
    };
    let manager = InstrumentManager::with_devices(
        devices,
        &config,
        SlotLogger::detached(),
        &CancellationToken::new(),
    );

    assert_eq!(manager.can().send("PING").await.unwrap(), "ACK:PING");
    assert_eq!(bus.reinitialize_count(), 0);
}

#[tokio::test]
async fn exhausted_retries_surface_as_error() {
    let mocks = MockInstrumentOptions::fast().with_can_failures(10, false);
    let config = test_config(mocks);
    let manager =
        InstrumentManager::new(&config, SlotLogger::detached(), &CancellationToken::new());

    let err = manager.can().send("PING").await.unwrap_err();
    let instrument_error = err.downcast_ref::<InstrumentError>();
    assert!(
        matches!(
            instrument_error,
            Some(InstrumentError::Exhausted { attempts: 3, .. })
        ),
        "unexpected error: {:#}",
        err
    );
}

#[tokio::test]
async fn psu_and_dmm_go_through_proxies() {
    let mocks = MockInstrumentOptions::fast();
    let config = test_config(mocks.clone());
    let psu = Arc::new(MockPsu::with_latency(&mocks.latency));
    let devices = DeviceSet {
        dmm: Arc::new(MockDmm::with_latency(8, &mocks.latency)),
        psu: psu.clone(),
        can: Arc::new(MockCanBus::new(&mocks)),
    };
    let manager = InstrumentManager::with_devices(
        devices,
        &config,
        SlotLogger::detached(),
        &CancellationToken::new(),
    );

    manager.psu().set_output(true, 5.0, 0.5).await.unwrap();
    let output = psu.output().unwrap();
    assert!(output.enabled);
    assert_eq!(output.voltage, 5.0);

    let reading = manager.dmm().measure_voltage().await.unwrap();
    assert!(reading.is_finite());
}

#[tokio::test]
async fn lease_serializes_concurrent_operations() {
    let config = test_config(MockInstrumentOptions::fast());
    let manager = Arc::new(InstrumentManager::new(
        &config,
        SlotLogger::detached(),
        &CancellationToken::new(),
    ));

    let cancel = CancellationToken::new();
    let lease = manager.leases().acquire("MockCan", &cancel).await.unwrap();
    assert!(manager.leases().is_leased("MockCan"));

    let sender = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.can().send("PING").await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!sender.is_finished(), "send must wait for the lease");

    drop(lease);
    let response = sender.await.unwrap().unwrap();
    assert_eq!(response, "ACK:PING");
    assert!(!manager.leases().is_leased("MockCan"));
}

#[tokio::test]
async fn cancellation_aborts_pending_operation() {
    let cancel = CancellationToken::new();
    let config = test_config(MockInstrumentOptions::fast());
    let manager = Arc::new(InstrumentManager::new(
        &config,
        SlotLogger::detached(),
        &cancel,
    ));

    let lease = manager
        .leases()
        .acquire("MockDmm", &CancellationToken::new())
        .await
        .unwrap();

    let reader = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.dmm().measure_voltage().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let err = reader.await.unwrap().unwrap_err();
    assert!(rust_station::error::is_cancelled(&err), "got {:#}", err);
    drop(lease);
}
