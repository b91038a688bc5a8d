//! Graph (Neo4j) session pool.
//!
//! The Bolt driver multiplexes its own connections; this pool bounds and
//! instruments session borrows with an owned-permit semaphore so a
//! `GraphSession` stays an exclusive, countable borrow like the other
//! handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use neo4rs::{query, BoltNull, BoltType, ConfigBuilder, Graph};
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::timeout;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;

use super::config::GraphPoolConfig;
use super::health::HealthTracker;
use super::metrics::{PoolMetrics, PoolStats};

const LOGGER: Logger = Logger::new("pool");

/// Bounded pool of graph sessions
pub struct GraphPool {
    config: GraphPoolConfig,
    graph: RwLock<Graph>,
    permits: Arc<Semaphore>,
    metrics: Arc<PoolMetrics>,
    health: Arc<HealthTracker>,
}

impl GraphPool {
    /// Connect the Bolt driver and set up session accounting
    pub async fn connect(config: GraphPoolConfig, health: Arc<HealthTracker>) -> Result<Self> {
        let graph = Self::build_graph(&config).await?;
        let permits = Arc::new(Semaphore::new(config.max_connections as usize));
        Ok(Self {
            config,
            graph: RwLock::new(graph),
            permits,
            metrics: Arc::new(PoolMetrics::default()),
            health,
        })
    }

    async fn build_graph(config: &GraphPoolConfig) -> Result<Graph> {
        let driver_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .build()
            .map_err(CoreError::from)?;
        Graph::connect(driver_config).await.map_err(CoreError::from)
    }

    async fn current_graph(&self) -> Graph {
        self.graph.read().await.clone()
    }

    /// Validate `min_connections` sessions concurrently; failures are logged
    /// and left to the health loop.
    pub async fn pre_warm(&self) {
        let graph = self.current_graph().await;
        let tasks = (0..self.config.min_connections).map(|_| {
            let graph = graph.clone();
            let metrics = self.metrics.clone();
            async move {
                match graph.run(query("RETURN 1")).await {
                    Ok(_) => {
                        metrics.record_created();
                        true
                    }
                    Err(_) => {
                        metrics.record_failed();
                        false
                    }
                }
            }
        });

        let results = futures::future::join_all(tasks).await;
        let warmed = results.iter().filter(|ok| **ok).count();
        LOGGER.info(
            "graph pool pre-warmed",
            &[
                ("warmed", json!(warmed)),
                ("requested", json!(self.config.min_connections)),
            ],
        );
    }

    /// Borrow a session; fails fast while the pool is degraded
    pub async fn acquire(&self) -> Result<GraphSession> {
        if !self.health.is_healthy() {
            self.metrics.record_failed();
            return Err(CoreError::external_service("graph pool unavailable")
                .with_code("POOL_UNAVAILABLE")
                .with_detail("pool", "graph"));
        }

        let started = Instant::now();
        let permit = timeout(
            self.config.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.metrics.record_failed();
            CoreError::external_service("graph acquire timed out")
                .with_code("POOL_TIMEOUT")
                .with_detail("pool", "graph")
        })?
        .map_err(|_| {
            self.metrics.record_failed();
            CoreError::system("graph session semaphore closed")
        })?;

        self.metrics.record_acquired(started.elapsed());

        Ok(GraphSession {
            graph: self.current_graph().await,
            _permit: permit,
            acquired_at: Instant::now(),
            metrics: self.metrics.clone(),
        })
    }

    /// Liveness probe; bypasses the degraded fast-fail gate
    pub async fn validate(&self) -> Result<()> {
        let graph = self.current_graph().await;
        timeout(self.config.acquire_timeout, graph.run(query("RETURN 1")))
            .await
            .map_err(|_| {
                CoreError::network("graph validation timed out").with_code("VALIDATION_TIMEOUT")
            })?
            .map_err(CoreError::from)
    }

    /// Reconnect the driver under the exclusion lock
    pub async fn rebuild(&self) -> Result<()> {
        let fresh = Self::build_graph(&self.config).await?;
        let mut guard = self.graph.write().await;
        *guard = fresh;
        drop(guard);
        LOGGER.warn("graph pool rebuilt", &[]);
        Ok(())
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.metrics.snapshot(self.health.state())
    }

    /// Health tracker for this pool
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub(crate) fn record_probe(&self, success: bool) {
        self.metrics.record_health_check(success);
    }
}

/// Exclusive borrow of a graph session
pub struct GraphSession {
    graph: Graph,
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
    metrics: Arc<PoolMetrics>,
}

impl GraphSession {
    /// Age of this borrow
    pub fn age(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    /// Run a Cypher query, returning each row as a JSON object
    pub async fn run(
        &self,
        cypher: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Vec<Value>> {
        let mut q = query(cypher);
        for (key, value) in params {
            q = q.param(key.as_str(), json_to_bolt(value));
        }

        let mut stream = self.graph.execute(q).await.map_err(CoreError::from)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(CoreError::from)? {
            let value = row.to::<Value>().map_err(|e| {
                CoreError::external_service(format!("graph row decode failed: {e}"))
                    .with_code("GRAPH_DECODE")
            })?;
            rows.push(value);
        }
        Ok(rows)
    }

    /// Run a Cypher statement, discarding any results
    pub async fn execute(&self, cypher: &str, params: &HashMap<String, Value>) -> Result<()> {
        let mut q = query(cypher);
        for (key, value) in params {
            q = q.param(key.as_str(), json_to_bolt(value));
        }
        self.graph.run(q).await.map_err(CoreError::from)
    }
}

impl Drop for GraphSession {
    fn drop(&mut self) {
        self.metrics.record_released();
    }
}

/// Convert a JSON parameter to its Bolt representation. Objects travel as
/// their JSON text; callers needing map parameters flatten them first.
fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(items) => {
            BoltType::List(items.iter().map(json_to_bolt).collect::<Vec<_>>().into())
        }
        Value::Object(_) => value.to_string().into(),
    }
}
