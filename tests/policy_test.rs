//! Integration tests for retry, circuit breaker and the instrument policy.

use rust_station::error::InstrumentError;
use rust_station::logging::{MemorySink, SlotLogger};
use rust_station::policy::{
    BreakerState, CircuitBreakerOptions, InstrumentPolicy, RetryOptions,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn policy(attempts: u32, threshold: u32, open_for: Duration) -> (InstrumentPolicy, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let policy = InstrumentPolicy::new(
        "MockPsu",
        RetryOptions::new(attempts, Duration::from_millis(1), false),
        CircuitBreakerOptions::new(threshold, open_for),
        Duration::from_millis(200),
        SlotLogger::new(sink.clone(), Uuid::new_v4(), 2),
    );
    (policy, sink)
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let (policy, sink) = policy(3, 10, Duration::from_secs(60));
    let calls = AtomicU32::new(0);

    let value = policy
        .execute(
            "set_output",
            &CancellationToken::new(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("brownout")
                    }
                    Ok(42)
                }
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(sink.contains("Attempt 2 failed"));
    assert_eq!(policy.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn open_breaker_rejects_without_calling_device() {
    let (policy, sink) = policy(5, 2, Duration::from_secs(60));
    let calls = AtomicU32::new(0);
    let cancel = CancellationToken::new();

    let first: Result<(), _> = policy
        .execute(
            "set_output",
            &cancel,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("overcurrent")) }
            },
            None,
        )
        .await;

    // the breaker opens after the second failure and blocks attempt three
    assert!(matches!(first, Err(InstrumentError::BreakerOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(policy.breaker().state(), BreakerState::Open);

    let second: Result<(), _> = policy
        .execute(
            "set_output",
            &cancel,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            },
            None,
        )
        .await;
    assert!(matches!(second, Err(InstrumentError::BreakerOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(sink.contains("Circuit open for MockPsu"));
}

#[tokio::test]
async fn breaker_admits_probe_after_open_window() {
    let (policy, _sink) = policy(1, 1, Duration::from_millis(20));
    let cancel = CancellationToken::new();

    let failed: Result<(), _> = policy
        .execute("set_output", &cancel, || async { Err::<(), _>(anyhow::anyhow!("trip")) }, None)
        .await;
    assert!(matches!(failed, Err(InstrumentError::Exhausted { attempts: 1, .. })));
    assert_eq!(policy.breaker().state(), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;

    policy
        .execute("set_output", &cancel, || async { Ok::<_, anyhow::Error>(()) }, None)
        .await
        .unwrap();
    assert_eq!(policy.breaker().state(), BreakerState::Closed);
}

#[tokio::test]
async fn cancellation_during_backoff_is_reported() {
    let sink = Arc::new(MemorySink::new());
    let policy = InstrumentPolicy::new(
        "MockDmm",
        RetryOptions::new(5, Duration::from_secs(30), false),
        CircuitBreakerOptions::new(10, Duration::from_secs(60)),
        Duration::from_millis(200),
        SlotLogger::new(sink, Uuid::new_v4(), 1),
    );
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        })
    };

    let started = std::time::Instant::now();
    let result: Result<(), _> = policy
        .execute("measure_voltage", &cancel, || async { Err::<(), _>(anyhow::anyhow!("noise")) }, None)
        .await;
    canceller.await.unwrap();

    assert!(matches!(result, Err(InstrumentError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}
