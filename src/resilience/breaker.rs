//! Circuit breaker for a named dependency.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;

const LOGGER: Logger = Logger::new("resilience");

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through; consecutive failures are counted
    Closed,
    /// Calls are rejected immediately
    Open,
    /// A single probe call is permitted
    HalfOpen,
}

/// Configuration for circuit breaker behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,

    /// Time the breaker stays open before admitting a probe
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Observed breaker counters
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerStats {
    /// Calls rejected while open
    pub rejections: u64,
    /// Times the breaker tripped open
    pub trips: u64,
    /// Current consecutive failure count
    pub consecutive_failures: u32,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    rejections: u64,
    trips: u64,
}

/// Circuit breaker protecting one named dependency.
///
/// All state transitions happen inside a single mutex region so concurrent
/// callers cannot double-trip or double-reset. The mutex is never held across
/// the protected call itself.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

enum Admission {
    Call,
    Probe,
}

impl CircuitBreaker {
    /// Create a breaker for the named dependency
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
                rejections: 0,
                trips: 0,
            }),
        }
    }

    /// Execute `op` under breaker protection.
    ///
    /// While open, rejects with an `ExternalService` error without touching
    /// the dependency.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.try_admit()?;
        let is_probe = matches!(admission, Admission::Probe);

        match op().await {
            Ok(value) => {
                self.on_success(is_probe);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(is_probe);
                Err(err)
            }
        }
    }

    fn try_admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Call),
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|at| at.elapsed());
                let due = elapsed.map_or(true, |e| e >= self.config.recovery_timeout);
                if due && !inner.probe_in_flight {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    LOGGER.info(
                        "breaker half-open, admitting probe",
                        &[("breaker", json!(self.name))],
                    );
                    Ok(Admission::Probe)
                } else {
                    inner.rejections += 1;
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejections += 1;
                    Err(self.open_error())
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if was_probe {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Closed;
            LOGGER.info(
                "breaker closed, dependency recovered",
                &[("breaker", json!(self.name))],
            );
        }
    }

    fn on_failure(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        if was_probe {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Open;
            inner.trips += 1;
            LOGGER.warn(
                "probe failed, breaker re-opened",
                &[("breaker", json!(self.name))],
            );
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.trips += 1;
            LOGGER.error(
                "failure threshold exceeded, breaker opened",
                &[
                    ("breaker", json!(self.name)),
                    ("failures", json!(inner.consecutive_failures)),
                ],
            );
        }
    }

    fn open_error(&self) -> CoreError {
        CoreError::external_service(format!("circuit breaker '{}' is open", self.name))
            .with_code("CIRCUIT_OPEN")
            .with_detail("breaker", self.name.clone())
    }

    /// Current state; may lag concurrent transitions by one call window
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Breaker counters
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            rejections: inner.rejections,
            trips: inner.trips,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "dep",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    async fn failing_call(b: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        b.call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::network("down")) }
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let b = breaker(3, 200);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(failing_call(&b, &calls).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Rejected without invoking the dependency
        let err = failing_call(&b, &calls).await.unwrap_err();
        assert_eq!(err.code, "CIRCUIT_OPEN");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(b.stats().rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes_and_zeroes_counter() {
        let b = breaker(2, 200);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let _ = failing_call(&b, &calls).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(201)).await;

        let result = b.call(|| async { Ok::<_, CoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker(1, 100);
        let calls = AtomicU32::new(0);

        let _ = failing_call(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(101)).await;
        let _ = failing_call(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.stats().trips, 2);

        // The clock was reset by the probe failure, so the next call is
        // rejected until another full recovery window elapses.
        tokio::time::advance(Duration::from_millis(50)).await;
        let err = failing_call(&b, &calls).await.unwrap_err();
        assert_eq!(err.code, "CIRCUIT_OPEN");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_admitted() {
        let b = breaker(1, 100);
        let calls = AtomicU32::new(0);
        let _ = failing_call(&b, &calls).await;

        tokio::time::advance(Duration::from_millis(101)).await;

        // First admission becomes the probe; a second concurrent attempt is
        // rejected while the probe is in flight.
        let admitted = b.try_admit();
        assert!(matches!(admitted, Ok(Admission::Probe)));
        let second = b.try_admit();
        assert!(second.is_err());
    }
}
