//! # ENGRAM - Personal Memory Service Core
//!
//! The storage-facing core of a personal memory service: short
//! natural-language messages are distilled into durable facts, stored in a
//! hybrid vector/graph/relational layout, and served back through semantic
//! and relationship retrieval. This crate is the systems layer the REST/MCP
//! surfaces sit on:
//!
//! - `cache`: multi-layer cache (in-process LRU, remote key-value,
//!   query-result) with coherent per-user invalidation
//! - `pool`: connection-pool manager for the relational, graph, and
//!   key-value stores with pre-warming, health and recovery loops
//! - `batch`: priority-queued batching engine for memory writes, vector
//!   searches, and graph queries
//! - `resilience`: retry, circuit breaker, and fallback composition
//! - `logging`: structured JSON logging with task-local correlation ids
//! - `errors`: closed error taxonomy with severity and recovery strategy
//!
//! The core holds no on-disk state of its own; everything in memory is
//! rebuilt lazily after a restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Error taxonomy
pub mod errors;

// Structured logging and correlation
pub mod logging;

// Typed configuration
pub mod config;

// Retry, breaker, fallback
pub mod resilience;

// Connection pools
pub mod pool;

// Multi-layer cache
pub mod cache;

// Batching engine
pub mod batch;

// Re-export commonly used types
pub use batch::{
    BatchPriority, BatchingManager, CompletionHandle, GraphQuery, MemoryWrite, SearchHit,
    VectorSearch,
};
pub use cache::{CacheStats, MultiLayerCache};
pub use config::CoreConfig;
pub use errors::{CoreError, ErrorKind, RecoveryStrategy, Result, Severity};
pub use logging::{correlation_scope, with_correlation, Logger};
pub use pool::{PoolHealth, PoolManager, PoolManagerStats};
pub use resilience::{BreakerConfig, CircuitState, ResilienceManager, RetryPolicy};

use std::sync::Arc;

use serde_json::Value;

const LOGGER: Logger = Logger::new("core");

/// Snapshot hook for out-of-scope layers that keep adaptive in-process state
/// (scoring thresholds, deduplication statistics, tag vocabularies).
///
/// The core never calls these methods itself; whether snapshots are
/// persisted, replicated, or discarded is the embedding layer's policy.
pub trait StateSnapshot {
    /// Serialize the adaptive state
    fn snapshot(&self) -> Value;

    /// Restore previously snapshotted state
    fn restore(&mut self, snapshot: Value) -> Result<()>;
}

/// The assembled memory core: pools, cache, batchers, and resilience wiring.
///
/// Construction order follows the dependency direction: pools first, the
/// cache over the pooled key-value client, then the batchers over both
/// facades. No component holds a back-reference to its callers.
pub struct MemoryCore {
    pools: Arc<PoolManager>,
    cache: Arc<MultiLayerCache>,
    resilience: Arc<ResilienceManager>,
    batching: BatchingManager,
}

impl MemoryCore {
    /// Validate the configuration and wire the core together.
    ///
    /// A key-value client that cannot be handed out at start-up leaves the
    /// cache running L1-only; the pool's recovery loop restores L2 service
    /// transparently on later writes.
    pub async fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let pools = Arc::new(PoolManager::initialize(config.pool.clone()).await?);

        let kv_client = match pools.get_key_value_client().await {
            Ok(client) => Some(client),
            Err(err) => {
                LOGGER.warn(
                    "key-value client unavailable at start-up, cache runs L1-only",
                    &[("error", serde_json::json!(err.to_string()))],
                );
                None
            }
        };
        let cache = Arc::new(MultiLayerCache::new(&config.cache, kv_client));

        let resilience = Arc::new(ResilienceManager::new(config.resilience.clone()));
        let batching = BatchingManager::new(pools.clone(), cache.clone(), config.batch.clone());

        Ok(Self {
            pools,
            cache,
            resilience,
            batching,
        })
    }

    /// Start the batch dispatch workers
    pub fn start(&self) {
        self.batching.start();
        LOGGER.info("memory core started", &[]);
    }

    /// Drain the batchers and close the pools
    pub async fn stop(&self) {
        self.batching.stop().await;
        self.pools.close().await;
        LOGGER.info("memory core stopped", &[]);
    }

    /// Connection-pool facade
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Cache facade
    pub fn cache(&self) -> &Arc<MultiLayerCache> {
        &self.cache
    }

    /// Resilience facade
    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    /// Batcher facade
    pub fn batching(&self) -> &BatchingManager {
        &self.batching
    }
}
