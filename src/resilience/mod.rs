//! Resilience primitives: retry, circuit breaker, fallback.
//!
//! The three patterns compose as `fallback(breaker(retry(op)))` — retries run
//! inside the breaker so a tripped breaker short-circuits before spending
//! retry attempts. [`ResilienceManager`] holds the registry of named breakers
//! and the default policies, and exposes the composed call.

mod breaker;
mod fallback;
mod retry;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use fallback::with_fallback;
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;

use crate::errors::Result;

/// Default policies for the composed resilient call
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Default retry policy
    pub retry: RetryPolicy,

    /// Default breaker policy
    pub breaker: BreakerConfig,
}

/// Aggregate counters across all resilient calls
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct ResilienceStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub fallbacks_used: u64,
}

/// Registry of named circuit breakers plus default retry policy
pub struct ResilienceManager {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    fallbacks_used: AtomicU64,
}

impl ResilienceManager {
    /// Create a manager with the given default policies
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            fallbacks_used: AtomicU64::new(0),
        }
    }

    /// Get or create the breaker for a named dependency using the default
    /// breaker policy
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, self.config.breaker.clone())
    }

    /// Get or create the breaker for a named dependency with an explicit
    /// policy; an existing breaker keeps its original policy
    pub fn breaker_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Default retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Run `op` as `breaker(retry(op))` against the named dependency
    pub async fn resilient<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let breaker = self.breaker(name);
        let policy = self.config.retry.clone();
        let result = breaker.call(|| policy.run(op)).await;

        match &result {
            Ok(_) => self.successful_calls.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed_calls.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Run `op` as `fallback(breaker(retry(op)))` against the named dependency
    pub async fn resilient_with_fallback<T, F, Fut, S, SF>(
        &self,
        name: &str,
        op: F,
        secondary: S,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        S: FnOnce() -> SF,
        SF: Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let breaker = self.breaker(name);
        let policy = self.config.retry.clone();

        let result = with_fallback(
            || async {
                let inner = breaker.call(|| policy.run(op)).await;
                if inner.is_err() {
                    self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
                }
                inner
            },
            secondary,
        )
        .await;

        match &result {
            Ok(_) => self.successful_calls.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed_calls.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Aggregate counters
    pub fn stats(&self) -> ResilienceStats {
        ResilienceStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
        }
    }

    /// States of all registered breakers, by name
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoreError;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn manager() -> ResilienceManager {
        ResilienceManager::new(ResilienceConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: 0.0,
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_millis(200),
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_run_inside_breaker() {
        let mgr = manager();
        let calls = AtomicU32::new(0);

        let result = mgr
            .resilient("search", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(CoreError::network("flaky"))
                    } else {
                        Ok("hit")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "hit");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The breaker saw one successful composed call, not three attempts.
        assert_eq!(mgr.breaker("search").stats().consecutive_failures, 0);
        assert_eq!(mgr.breaker("search").state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_retries() {
        let mgr = ResilienceManager::new(ResilienceConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            breaker: BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        });
        let calls = AtomicU32::new(0);

        // Trip the breaker: RETRY_EXHAUSTED keeps the underlying Network kind.
        let _ = mgr
            .resilient("graph", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CoreError::network("down")) }
            })
            .await;
        let after_trip = calls.load(Ordering::SeqCst);
        assert_eq!(after_trip, 3);

        // Now the breaker rejects before any attempt is spent.
        let err = mgr
            .resilient("graph", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CoreError::network("down")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, "CIRCUIT_OPEN");
        assert_eq!(calls.load(Ordering::SeqCst), after_trip);
    }

    #[tokio::test]
    async fn test_fallback_counts() {
        let mgr = manager();
        let result = mgr
            .resilient_with_fallback(
                "kv",
                || async { Err::<i32, _>(CoreError::validation("nope")) },
                || async { Ok(9) },
            )
            .await;

        assert_eq!(result.unwrap(), 9);
        assert_eq!(mgr.stats().fallbacks_used, 1);
        assert_eq!(mgr.stats().successful_calls, 1);
    }

    #[tokio::test]
    async fn test_breaker_registry_reuses_instances() {
        let mgr = manager();
        let a = mgr.breaker("relational");
        let b = mgr.breaker("relational");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.breaker_states().len(), 1);
    }
}
