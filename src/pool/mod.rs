//! Connection-pool management for the three backing stores.
//!
//! One typed pool per store kind (relational, graph, key-value), each with
//! pre-warming, a periodic health loop, and a recovery loop that re-validates
//! or rebuilds the driver handle. While a pool is degraded, acquisition fails
//! fast instead of blocking out the acquire timeout; the circuit breaker in
//! front of callers is what shields the stores from stampedes.

pub mod config;
mod graph;
mod health;
mod key_value;
mod metrics;
mod relational;

pub use config::{
    GraphPoolConfig, KeyValuePoolConfig, PoolManagerConfig, RelationalPoolConfig,
};
pub use graph::{GraphPool, GraphSession};
pub use health::{HealthTracker, HealthTransition, PoolHealth};
pub use key_value::KeyValuePool;
pub use metrics::{PoolMetrics, PoolStats};
pub use relational::{RelationalHandle, RelationalPool};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::errors::Result;
use crate::logging::Logger;

const LOGGER: Logger = Logger::new("pool");

/// Uniform supervision surface over the three pool types
#[async_trait]
trait SupervisedPool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn validate(&self) -> Result<()>;
    async fn rebuild(&self) -> Result<()>;
    fn health(&self) -> &Arc<HealthTracker>;
    fn record_health_check(&self, success: bool);
}

macro_rules! supervised_impl {
    ($pool:ty, $name:literal) => {
        #[async_trait]
        impl SupervisedPool for $pool {
            fn name(&self) -> &'static str {
                $name
            }

            async fn validate(&self) -> Result<()> {
                self.validate().await
            }

            async fn rebuild(&self) -> Result<()> {
                self.rebuild().await
            }

            fn health(&self) -> &Arc<HealthTracker> {
                self.health()
            }

            fn record_health_check(&self, success: bool) {
                self.record_probe(success);
            }
        }
    };
}

supervised_impl!(RelationalPool, "relational");
supervised_impl!(GraphPool, "graph");
supervised_impl!(KeyValuePool, "key_value");

/// Aggregated statistics across all pools
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct PoolManagerStats {
    pub relational: PoolStats,
    pub graph: PoolStats,
    pub key_value: PoolStats,
}

/// Facade owning the three pools and their supervision loops
pub struct PoolManager {
    config: PoolManagerConfig,
    relational: Arc<RelationalPool>,
    graph: Arc<GraphPool>,
    key_value: Arc<KeyValuePool>,
    running: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    /// Connect all three pools, pre-warm them, and start health monitoring.
    ///
    /// Pre-warm validation failures are logged, not fatal; the health loop
    /// keeps retrying. Driver handles that cannot be constructed at all are
    /// a hard error.
    pub async fn initialize(config: PoolManagerConfig) -> Result<Self> {
        let tracker = |_: &str| {
            Arc::new(HealthTracker::new(
                config.failure_threshold,
                config.recovery_successes,
            ))
        };

        let relational = Arc::new(RelationalPool::connect_lazy(
            config.relational.clone(),
            tracker("relational"),
        )?);
        let graph = Arc::new(GraphPool::connect(config.graph.clone(), tracker("graph")).await?);
        let key_value =
            Arc::new(KeyValuePool::connect(config.key_value.clone(), tracker("key_value")).await?);

        futures::join!(
            relational.pre_warm(),
            graph.pre_warm(),
            key_value.pre_warm()
        );

        let manager = Self {
            config,
            relational,
            graph,
            key_value,
            running: Arc::new(AtomicBool::new(true)),
            tasks: parking_lot::Mutex::new(Vec::new()),
        };
        manager.start_health_loops();

        LOGGER.info("all connection pools initialized", &[]);
        Ok(manager)
    }

    fn start_health_loops(&self) {
        let pools: [Arc<dyn SupervisedPool>; 3] = [
            self.relational.clone(),
            self.graph.clone(),
            self.key_value.clone(),
        ];

        let mut tasks = self.tasks.lock();
        for pool in pools {
            tasks.push(spawn_health_loop(
                pool,
                self.config.health_check_interval,
                self.config.recovery_check_interval,
                self.running.clone(),
            ));
        }
    }

    /// Borrow a relational connection
    pub async fn acquire_relational(&self) -> Result<RelationalHandle> {
        self.relational.acquire().await
    }

    /// Borrow a graph session
    pub async fn acquire_graph(&self) -> Result<GraphSession> {
        self.graph.acquire().await
    }

    /// Get the shared key-value client
    pub async fn get_key_value_client(&self) -> Result<ConnectionManager> {
        self.key_value.client().await
    }

    /// The relational pool
    pub fn relational(&self) -> &Arc<RelationalPool> {
        &self.relational
    }

    /// The graph pool
    pub fn graph(&self) -> &Arc<GraphPool> {
        &self.graph
    }

    /// The key-value pool
    pub fn key_value(&self) -> &Arc<KeyValuePool> {
        &self.key_value
    }

    /// Statistics for every pool
    pub fn stats(&self) -> PoolManagerStats {
        PoolManagerStats {
            relational: self.relational.stats(),
            graph: self.graph.stats(),
            key_value: self.key_value.stats(),
        }
    }

    /// Stop supervision and close the drivers
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.relational.close().await;
        LOGGER.info("all connection pools closed", &[]);
    }
}

fn spawn_health_loop(
    pool: Arc<dyn SupervisedPool>,
    check_interval: std::time::Duration,
    recovery_interval: std::time::Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(check_interval);
        // The first tick fires immediately; skip it so start-up pre-warm
        // results are not double-counted.
        ticker.tick().await;

        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let outcome = pool.validate().await;
            let transition = match &outcome {
                Ok(()) => pool.health().record_validation(true),
                Err(err) if err.code == "VALIDATION_TIMEOUT" => pool.health().record_timeout(),
                Err(_) => pool.health().record_validation(false),
            };
            pool.record_health_check(outcome.is_ok());

            if let Err(err) = &outcome {
                LOGGER.warn(
                    "health probe failed",
                    &[
                        ("pool", json!(pool.name())),
                        ("error", json!(err.to_string())),
                    ],
                );
            }

            if transition == Some(HealthTransition::Degraded) && pool.health().begin_recovery() {
                LOGGER.error(
                    "pool degraded, starting recovery loop",
                    &[("pool", json!(pool.name()))],
                );
                tokio::spawn(recovery_loop(
                    pool.clone(),
                    recovery_interval,
                    running.clone(),
                ));
            }
        }
    })
}

async fn recovery_loop(
    pool: Arc<dyn SupervisedPool>,
    recovery_interval: std::time::Duration,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval(recovery_interval);
    ticker.tick().await;

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;

        match pool.validate().await {
            Ok(()) => {
                if pool.health().record_validation(true) == Some(HealthTransition::Recovered) {
                    LOGGER.info("pool recovered", &[("pool", json!(pool.name()))]);
                    return;
                }
            }
            Err(err) => {
                pool.health().record_validation(false);
                LOGGER.warn(
                    "recovery validation failed, rebuilding driver handle",
                    &[
                        ("pool", json!(pool.name())),
                        ("error", json!(err.to_string())),
                    ],
                );
                if let Err(rebuild_err) = pool.rebuild().await {
                    LOGGER.warn(
                        "driver rebuild failed",
                        &[
                            ("pool", json!(pool.name())),
                            ("error", json!(rebuild_err.to_string())),
                        ],
                    );
                }
            }
        }
    }
}
