//! Per-instrument circuit breaker.
//!
//! Closed until `failure_threshold` consecutive failures, then Open for
//! `open_duration`. The first request after the window is let through as an
//! implicit half-open trial: success closes the breaker, failure re-opens it
//! with a fresh window.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Consecutive failures that open the breaker (>= 1)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker rejects requests once open
    #[serde(default = "default_open_duration", with = "humantime_serde")]
    pub open_duration: Duration,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_duration() -> Duration {
    Duration::from_secs(2)
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration: default_open_duration(),
        }
    }
}

impl CircuitBreakerOptions {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Open window elapsed; the next request is a trial
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options: CircuitBreakerOptions {
                failure_threshold: options.failure_threshold.max(1),
                ..options
            },
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    /// False only while open and inside the open window.
    pub fn allow_request(&self) -> bool {
        match self.inner.lock().opened_at {
            None => true,
            Some(opened_at) => opened_at.elapsed() >= self.options.open_duration,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.options.failure_threshold {
            if inner.opened_at.is_none() {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.opened_at.take().is_some() {
            tracing::info!("Circuit breaker closed");
        }
        inner.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock().opened_at {
            None => BreakerState::Closed,
            Some(opened_at) if opened_at.elapsed() >= self.options.open_duration => {
                BreakerState::HalfOpen
            }
            Some(_) => BreakerState::Open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions::new(3, Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_counter() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions::new(2, Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.allow_request());
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn half_open_after_window() {
        let breaker =
            CircuitBreaker::new(CircuitBreakerOptions::new(1, Duration::from_millis(20)));
        breaker.record_failure();
        assert!(!breaker.allow_request());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // failed trial re-opens with a fresh window
        breaker.record_failure();
        assert!(!breaker.allow_request());

        tokio::time::sleep(Duration::from_millis(40)).await;
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
