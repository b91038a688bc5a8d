//! Batching and pipelining for memory writes, vector searches, and graph
//! queries.
//!
//! A generic priority-queued [`BatchProcessor`] coalesces requests into
//! timed, size-capped, retrying batches dispatched through the pooled
//! connections. Three specialisations cover the store-facing operations;
//! [`BatchingManager`] owns their lifecycles.

mod graph;
mod processor;
mod request;
mod search;
mod write;

pub use graph::{graph_tuning, GraphBatcher, GraphQuery};
pub use processor::{BatchDispatcher, BatchProcessor, BatchTuning, BatcherStats};
pub use request::{BatchPriority, CompletionHandle};
pub use search::{search_tuning, SearchBatcher, SearchHit, VectorSearch};
pub use write::{write_tuning, MemoryWrite, WriteBatcher};

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::cache::MultiLayerCache;
use crate::errors::Result;
use crate::logging::Logger;
use crate::pool::PoolManager;

use serde_json::Value;

const LOGGER: Logger = Logger::new("batch");

/// Tuning for the three batcher specialisations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Memory write batcher knobs
    pub write: BatchTuning,

    /// Vector search batcher knobs
    pub search: BatchTuning,

    /// Graph query batcher knobs
    pub graph: BatchTuning,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            write: write_tuning(),
            search: search_tuning(),
            graph: graph_tuning(),
        }
    }
}

/// Statistics from all three batchers
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct BatchingStats {
    pub write: BatcherStats,
    pub search: BatcherStats,
    pub graph: BatcherStats,
}

/// Facade owning the write, search, and graph batchers.
///
/// Constructed over the pool and cache facades — the batcher depends on
/// them, never the other way around.
pub struct BatchingManager {
    write: WriteBatcher,
    search: SearchBatcher,
    graph: GraphBatcher,
}

impl BatchingManager {
    /// Build all three batchers
    pub fn new(
        pools: Arc<PoolManager>,
        cache: Arc<MultiLayerCache>,
        config: BatchConfig,
    ) -> Self {
        Self {
            write: WriteBatcher::new(pools.clone(), cache, config.write),
            search: SearchBatcher::new(pools.clone(), config.search),
            graph: GraphBatcher::new(pools, config.graph),
        }
    }

    /// Start every batcher
    pub fn start(&self) {
        self.write.start();
        self.search.start();
        self.graph.start();
        LOGGER.info("batching manager started", &[]);
    }

    /// Stop every batcher, draining queued work
    pub async fn stop(&self) {
        self.write.stop().await;
        self.search.stop().await;
        self.graph.stop().await;
        LOGGER.info("batching manager stopped", &[]);
    }

    /// Enqueue a memory write
    pub async fn submit_write(
        &self,
        write: MemoryWrite,
        priority: BatchPriority,
    ) -> Result<CompletionHandle<Uuid>> {
        self.write.submit(write, priority).await
    }

    /// Enqueue a vector search
    pub async fn submit_search(
        &self,
        search: VectorSearch,
        priority: BatchPriority,
    ) -> Result<CompletionHandle<Vec<SearchHit>>> {
        self.search.submit(search, priority).await
    }

    /// Enqueue a graph query
    pub async fn submit_graph_query(
        &self,
        query: GraphQuery,
        priority: BatchPriority,
    ) -> Result<CompletionHandle<Vec<Value>>> {
        self.graph.submit(query, priority).await
    }

    /// The write batcher
    pub fn writes(&self) -> &WriteBatcher {
        &self.write
    }

    /// The search batcher
    pub fn searches(&self) -> &SearchBatcher {
        &self.search
    }

    /// The graph batcher
    pub fn graph_queries(&self) -> &GraphBatcher {
        &self.graph
    }

    /// Statistics from every batcher
    pub fn stats(&self) -> BatchingStats {
        BatchingStats {
            write: self.write.stats(),
            search: self.search.stats(),
            graph: self.graph.stats(),
        }
    }
}
