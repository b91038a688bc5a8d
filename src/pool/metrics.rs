//! Per-pool acquisition and lifecycle metrics.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::health::PoolHealth;

/// Recent acquisition waits kept for percentile estimation
const WAIT_SAMPLE_CAPACITY: usize = 256;

#[derive(Default)]
struct MetricsInner {
    created: u64,
    closed: u64,
    failed: u64,
    in_use: u32,
    idle: u32,
    wait_samples: VecDeque<Duration>,
    wait_total: Duration,
    wait_count: u64,
    last_health_check: Option<DateTime<Utc>>,
    health_check_failures: u64,
}

/// Thread-safe metrics for one pool
#[derive(Default)]
pub struct PoolMetrics {
    inner: Mutex<MetricsInner>,
}

impl PoolMetrics {
    /// Record a successful acquisition and its wait time
    pub fn record_acquired(&self, wait: Duration) {
        let mut inner = self.inner.lock();
        inner.in_use += 1;
        inner.idle = inner.idle.saturating_sub(1);
        inner.wait_total += wait;
        inner.wait_count += 1;
        if inner.wait_samples.len() == WAIT_SAMPLE_CAPACITY {
            inner.wait_samples.pop_front();
        }
        inner.wait_samples.push_back(wait);
    }

    /// Record a handle release
    pub fn record_released(&self) {
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.idle += 1;
    }

    /// Record a new connection
    pub fn record_created(&self) {
        let mut inner = self.inner.lock();
        inner.created += 1;
        inner.idle += 1;
    }

    /// Record a closed or discarded connection
    pub fn record_closed(&self) {
        let mut inner = self.inner.lock();
        inner.closed += 1;
        inner.in_use = inner.in_use.saturating_sub(1);
    }

    /// Record a failed acquisition or validation
    pub fn record_failed(&self) {
        self.inner.lock().failed += 1;
    }

    /// Record the outcome of a health probe
    pub fn record_health_check(&self, success: bool) {
        let mut inner = self.inner.lock();
        inner.last_health_check = Some(Utc::now());
        if !success {
            inner.health_check_failures += 1;
        }
    }

    /// Overwrite the utilization gauges from the driver's own accounting
    pub fn set_utilization(&self, in_use: u32, idle: u32) {
        let mut inner = self.inner.lock();
        inner.in_use = in_use;
        inner.idle = idle;
    }

    /// Snapshot the counters together with the current health state
    pub fn snapshot(&self, health: PoolHealth) -> PoolStats {
        let inner = self.inner.lock();

        let mean_wait_ms = if inner.wait_count > 0 {
            inner.wait_total.as_secs_f64() * 1000.0 / inner.wait_count as f64
        } else {
            0.0
        };

        let p95_wait_ms = if inner.wait_samples.is_empty() {
            0.0
        } else {
            let mut sorted: Vec<Duration> = inner.wait_samples.iter().copied().collect();
            sorted.sort_unstable();
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            sorted[rank.saturating_sub(1).min(sorted.len() - 1)].as_secs_f64() * 1000.0
        };

        PoolStats {
            health,
            created: inner.created,
            closed: inner.closed,
            failed: inner.failed,
            in_use: inner.in_use,
            idle: inner.idle,
            acquisitions: inner.wait_count,
            mean_wait_ms,
            p95_wait_ms,
            last_health_check: inner.last_health_check,
            health_check_failures: inner.health_check_failures,
        }
    }
}

/// Point-in-time statistics for one pool
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current health state
    pub health: PoolHealth,
    /// Connections created
    pub created: u64,
    /// Connections closed or discarded
    pub closed: u64,
    /// Failed acquisitions and validations
    pub failed: u64,
    /// Handles currently borrowed
    pub in_use: u32,
    /// Idle handles
    pub idle: u32,
    /// Total successful acquisitions
    pub acquisitions: u64,
    /// Mean acquisition wait
    pub mean_wait_ms: f64,
    /// 95th-percentile acquisition wait over recent samples
    pub p95_wait_ms: f64,
    /// When the last health probe ran
    pub last_health_check: Option<DateTime<Utc>>,
    /// Health probe failures since start
    pub health_check_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let m = PoolMetrics::default();
        m.record_created();
        m.record_acquired(Duration::from_millis(4));
        let stats = m.snapshot(PoolHealth::Healthy);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.idle, 0);

        m.record_released();
        let stats = m.snapshot(PoolHealth::Healthy);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.acquisitions, 1);
    }

    #[test]
    fn test_wait_percentiles() {
        let m = PoolMetrics::default();
        for ms in 1..=100u64 {
            m.record_acquired(Duration::from_millis(ms));
        }
        let stats = m.snapshot(PoolHealth::Healthy);
        assert!((stats.mean_wait_ms - 50.5).abs() < 0.1);
        assert!((stats.p95_wait_ms - 95.0).abs() < 1.0);
    }

    #[test]
    fn test_sample_reservoir_bounded() {
        let m = PoolMetrics::default();
        for _ in 0..10_000 {
            m.record_acquired(Duration::from_millis(1));
        }
        assert!(m.inner.lock().wait_samples.len() <= WAIT_SAMPLE_CAPACITY);
    }

    #[test]
    fn test_health_check_failures_counted() {
        let m = PoolMetrics::default();
        m.record_health_check(true);
        m.record_health_check(false);
        m.record_health_check(false);
        let stats = m.snapshot(PoolHealth::Degraded);
        assert_eq!(stats.health_check_failures, 2);
        assert!(stats.last_health_check.is_some());
    }
}
