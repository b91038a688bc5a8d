//! Per-pool health state machine.

use parking_lot::Mutex;

/// Observed health of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    /// Validations passing; acquisition allowed
    Healthy,
    /// Validation failures past threshold; acquisition fails fast
    Degraded,
    /// Recovery loop running; acquisition still fails fast
    Recovering,
}

/// Transition produced by recording a validation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Pool just flipped to degraded; the caller should start the recovery loop
    Degraded,
    /// Pool just recovered; the recovery loop should exit
    Recovered,
}

struct TrackerInner {
    state: PoolHealth,
    consecutive_failures: u32,
    consecutive_successes: u32,
    recovery_active: bool,
}

/// Tracks validation outcomes and drives the
/// `Healthy -> Degraded -> Recovering -> Healthy` cycle.
///
/// Pure state: the pools own the probes and the loops; this type only decides
/// transitions, which keeps the machine unit-testable without live stores.
pub struct HealthTracker {
    failure_threshold: u32,
    recovery_successes: u32,
    inner: Mutex<TrackerInner>,
}

impl HealthTracker {
    /// Create a tracker; `failure_threshold` consecutive failures degrade,
    /// `recovery_successes` consecutive successes recover.
    pub fn new(failure_threshold: u32, recovery_successes: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_successes: recovery_successes.max(1),
            inner: Mutex::new(TrackerInner {
                state: PoolHealth::Healthy,
                consecutive_failures: 0,
                consecutive_successes: 0,
                recovery_active: false,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> PoolHealth {
        self.inner.lock().state
    }

    /// Whether acquisition should be admitted
    pub fn is_healthy(&self) -> bool {
        self.state() == PoolHealth::Healthy
    }

    /// Record the outcome of a validation probe
    pub fn record_validation(&self, success: bool) -> Option<HealthTransition> {
        let mut inner = self.inner.lock();
        if success {
            inner.consecutive_failures = 0;
            match inner.state {
                PoolHealth::Healthy => None,
                PoolHealth::Degraded => None,
                PoolHealth::Recovering => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.recovery_successes {
                        inner.state = PoolHealth::Healthy;
                        inner.recovery_active = false;
                        inner.consecutive_successes = 0;
                        Some(HealthTransition::Recovered)
                    } else {
                        None
                    }
                }
            }
        } else {
            inner.consecutive_successes = 0;
            inner.consecutive_failures += 1;
            if inner.state == PoolHealth::Healthy
                && inner.consecutive_failures >= self.failure_threshold
            {
                inner.state = PoolHealth::Degraded;
                Some(HealthTransition::Degraded)
            } else {
                None
            }
        }
    }

    /// Record a validation that timed out; degrades immediately from Healthy
    pub fn record_timeout(&self) -> Option<HealthTransition> {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.consecutive_failures = inner.consecutive_failures.max(self.failure_threshold);
        if inner.state == PoolHealth::Healthy {
            inner.state = PoolHealth::Degraded;
            Some(HealthTransition::Degraded)
        } else {
            None
        }
    }

    /// Claim the recovery loop. Returns `true` for exactly one caller per
    /// degradation; that caller transitions the pool to Recovering.
    pub fn begin_recovery(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == PoolHealth::Degraded && !inner.recovery_active {
            inner.recovery_active = true;
            inner.state = PoolHealth::Recovering;
            inner.consecutive_successes = 0;
            true
        } else {
            false
        }
    }

    /// Consecutive validation failures observed
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}
