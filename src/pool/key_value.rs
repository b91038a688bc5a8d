//! Key-value (Redis) connection pool.
//!
//! The connection manager multiplexes commands over a keepalive connection
//! and reconnects on its own; the pool wraps it with the same validation,
//! health, and metrics contract as the other stores.

use redis::aio::ConnectionManager;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;

use super::config::KeyValuePoolConfig;
use super::health::HealthTracker;
use super::metrics::{PoolMetrics, PoolStats};

const LOGGER: Logger = Logger::new("pool");

/// Managed Redis client with ping validation
pub struct KeyValuePool {
    config: KeyValuePoolConfig,
    manager: RwLock<ConnectionManager>,
    metrics: Arc<PoolMetrics>,
    health: Arc<HealthTracker>,
}

impl KeyValuePool {
    /// Open the connection manager
    pub async fn connect(config: KeyValuePoolConfig, health: Arc<HealthTracker>) -> Result<Self> {
        let manager = Self::build_manager(&config).await?;
        Ok(Self {
            config,
            manager: RwLock::new(manager),
            metrics: Arc::new(PoolMetrics::default()),
            health,
        })
    }

    async fn build_manager(config: &KeyValuePoolConfig) -> Result<ConnectionManager> {
        let client = redis::Client::open(config.url.as_str()).map_err(CoreError::from)?;
        ConnectionManager::new(client).await.map_err(CoreError::from)
    }

    /// Run `min_connections` ping validations; failures are logged and left
    /// to the health loop.
    pub async fn pre_warm(&self) {
        let mut warmed = 0usize;
        for _ in 0..self.config.min_connections {
            match self.validate().await {
                Ok(()) => {
                    self.metrics.record_created();
                    warmed += 1;
                }
                Err(_) => self.metrics.record_failed(),
            }
        }
        LOGGER.info(
            "key-value pool pre-warmed",
            &[
                ("warmed", json!(warmed)),
                ("requested", json!(self.config.min_connections)),
            ],
        );
    }

    /// Hand out the shared client; fails fast while degraded
    pub async fn client(&self) -> Result<ConnectionManager> {
        if !self.health.is_healthy() {
            self.metrics.record_failed();
            return Err(CoreError::external_service("key-value pool unavailable")
                .with_code("POOL_UNAVAILABLE")
                .with_detail("pool", "key_value"));
        }
        Ok(self.manager.read().await.clone())
    }

    /// `PING` validation; bypasses the degraded fast-fail gate
    pub async fn validate(&self) -> Result<()> {
        let mut manager = self.manager.read().await.clone();
        let pong: String = timeout(
            self.config.acquire_timeout,
            redis::cmd("PING").query_async(&mut manager),
        )
        .await
        .map_err(|_| {
            CoreError::network("key-value validation timed out").with_code("VALIDATION_TIMEOUT")
        })?
        .map_err(CoreError::from)?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(CoreError::external_service("unexpected ping reply")
                .with_detail("reply", pong))
        }
    }

    /// Reconnect the manager under the exclusion lock
    pub async fn rebuild(&self) -> Result<()> {
        let fresh = Self::build_manager(&self.config).await?;
        let mut guard = self.manager.write().await;
        *guard = fresh;
        drop(guard);
        LOGGER.warn("key-value pool rebuilt", &[]);
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
