//! Graph-query batcher.
//!
//! Queries are assumed heterogeneous, so there is no cross-request
//! coalescing: each runs inside its own session from the graph pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;
use crate::pool::PoolManager;

use super::processor::{BatchDispatcher, BatchProcessor, BatchTuning, BatcherStats};
use super::request::{BatchPriority, CompletionHandle};

/// One relationship query over a principal's memory graph
#[derive(Debug, Clone)]
pub struct GraphQuery {
    /// Owning principal; carried for correlation, not for coalescing
    pub user_id: String,

    /// Cypher text
    pub cypher: String,

    /// Query parameters
    pub params: HashMap<String, Value>,
}

/// Default tuning for the graph batcher
pub fn graph_tuning() -> BatchTuning {
    BatchTuning {
        batch_size: 10,
        flush_interval: Duration::from_millis(100),
        workers: 2,
        request_timeout: Duration::from_secs(15),
        ..BatchTuning::default()
    }
}

struct GraphDispatcher {
    pools: Arc<PoolManager>,
}

#[async_trait]
impl BatchDispatcher<GraphQuery, Vec<Value>> for GraphDispatcher {
    async fn dispatch(&self, requests: &[GraphQuery]) -> Result<Vec<Result<Vec<Value>>>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = match self.pools.acquire_graph().await {
                Ok(session) => session.run(&request.cypher, &request.params).await,
                Err(err) => Err(err),
            };
            results.push(outcome);
        }
        Ok(results)
    }
}

/// Batcher for graph queries
pub struct GraphBatcher {
    processor: BatchProcessor<GraphQuery, Vec<Value>>,
}

impl GraphBatcher {
    /// Create the batcher over the pool facade
    pub fn new(pools: Arc<PoolManager>, tuning: BatchTuning) -> Self {
        let dispatcher = Arc::new(GraphDispatcher { pools });
        Self {
            processor: BatchProcessor::new("graph_query", tuning, dispatcher),
        }
    }

    /// Start dispatch workers
    pub fn start(&self) {
        self.processor.start();
    }

    /// Stop and drain
    pub async fn stop(&self) {
        self.processor.stop().await;
    }

    /// Enqueue a query; the handle resolves with the result rows
    pub async fn submit(
        &self,
        query: GraphQuery,
        priority: BatchPriority,
    ) -> Result<CompletionHandle<Vec<Value>>> {
        self.processor.submit(query, priority, None).await
    }

    /// Batcher statistics
    pub fn stats(&self) -> BatcherStats {
        self.processor.stats()
    }
}
