//! Relational (PostgreSQL + pgvector) connection pool.

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;

use super::config::RelationalPoolConfig;
use super::health::HealthTracker;
use super::metrics::{PoolMetrics, PoolStats};

const LOGGER: Logger = Logger::new("pool");

/// Pooled PostgreSQL connections with a consistent server-side session
/// profile applied on creation.
pub struct RelationalPool {
    config: RelationalPoolConfig,
    // Behind a lock so the recovery loop can rebuild the driver handle; reads
    // clone the cheap pool handle and never hold the lock across a query.
    pool: RwLock<PgPool>,
    metrics: Arc<PoolMetrics>,
    health: Arc<HealthTracker>,
}

impl RelationalPool {
    /// Create the pool lazily; connections open on first use and at pre-warm.
    pub fn connect_lazy(
        config: RelationalPoolConfig,
        health: Arc<HealthTracker>,
    ) -> Result<Self> {
        let pool = Self::build_pool(&config)?;
        Ok(Self {
            config,
            pool: RwLock::new(pool),
            metrics: Arc::new(PoolMetrics::default()),
            health,
        })
    }

    fn connect_options(config: &RelationalPoolConfig) -> Result<PgConnectOptions> {
        let statement_timeout = format!("{}ms", config.statement_timeout.as_millis());
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| {
                CoreError::validation(format!("invalid relational url: {e}"))
                    .with_detail("key", "pool.relational.url")
            })?
            .application_name("engram")
            .options([
                // JIT off for consistent latency on short vector queries
                ("jit", "off"),
                ("statement_timeout", statement_timeout.as_str()),
                ("lock_timeout", "10s"),
            ]);
        Ok(options)
    }

    fn build_pool(config: &RelationalPoolConfig) -> Result<PgPool> {
        let options = Self::connect_options(config)?;
        Ok(PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .test_before_acquire(true)
            .connect_lazy_with(options))
    }

    async fn current_pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Open and validate `min_connections` handles. Failures are logged and
    /// left to the health loop; start-up proceeds.
    pub async fn pre_warm(&self) {
        let pool = self.current_pool().await;
        let tasks = (0..self.config.min_connections).map(|_| {
            let pool = pool.clone();
            let metrics = self.metrics.clone();
            async move {
                match pool.acquire().await {
                    Ok(mut conn) => match sqlx::query("SELECT 1").execute(&mut *conn).await {
                        Ok(_) => {
                            metrics.record_created();
                            true
                        }
                        Err(_) => {
                            metrics.record_failed();
                            false
                        }
                    },
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
            "relational pool pre-warmed",
            &[
                ("warmed", json!(warmed)),
                ("requested", json!(self.config.min_connections)),
            ],
        );
    }

    /// Borrow a connection.
    ///
    /// Fails fast with an `ExternalService` error while the pool is degraded
    /// instead of blocking out the acquire timeout; the breaker in front of
    /// callers handles stampedes during outages.
    pub async fn acquire(&self) -> Result<RelationalHandle> {
        if !self.health.is_healthy() {
            self.metrics.record_failed();
            return Err(CoreError::external_service("relational pool unavailable")
                .with_code("POOL_UNAVAILABLE")
                .with_detail("pool", "relational"));
        }

        let pool = self.current_pool().await;
        let started = Instant::now();
        let conn = timeout(self.config.acquire_timeout, pool.acquire())
            .await
            .map_err(|_| {
                self.metrics.record_failed();
                CoreError::external_service("relational acquire timed out")
                    .with_code("POOL_TIMEOUT")
                    .with_detail("pool", "relational")
            })?
            .map_err(|e| {
                self.metrics.record_failed();
                CoreError::from(e)
            })?;

        self.metrics.record_acquired(started.elapsed());
        self.metrics
            .set_utilization(pool.size() - pool.num_idle() as u32, pool.num_idle() as u32);

        Ok(RelationalHandle {
            conn: Some(conn),
            acquired_at: Instant::now(),
            metrics: self.metrics.clone(),
        })
    }

    /// Run the liveness probe on a borrowed connection.
    ///
    /// Bypasses the degraded fast-fail gate so the health and recovery loops
    /// can keep probing while the pool is down.
    pub async fn validate(&self) -> Result<()> {
        let pool = self.current_pool().await;
        let result = timeout(self.config.acquire_timeout, async {
            let mut conn = pool.acquire().await.map_err(CoreError::from)?;
            sqlx::query("SELECT 1")
                .execute(&mut *conn)
                .await
                .map_err(CoreError::from)?;
            Ok::<_, CoreError>(())
        })
        .await
        .map_err(|_| {
            CoreError::network("relational validation timed out").with_code("VALIDATION_TIMEOUT")
        })?;
        result
    }

    /// Replace the driver pool under the exclusion lock; used by the recovery
    /// loop when the existing handle is unrecoverable.
    pub async fn rebuild(&self) -> Result<()> {
        let fresh = Self::build_pool(&self.config)?;
        let mut guard = self.pool.write().await;
        let old = std::mem::replace(&mut *guard, fresh);
        drop(guard);
        old.close().await;
        LOGGER.warn("relational pool rebuilt", &[]);
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

    /// Close the underlying pool
    pub async fn close(&self) {
        self.current_pool().await.close().await;
    }
}

/// Scoped borrow of a relational connection.
///
/// Exactly one borrower at a time; releases back to the pool on drop along
/// every exit path. A handle that failed validation should be [`discard`]ed
/// instead of returned.
///
/// [`discard`]: RelationalHandle::discard
pub struct RelationalHandle {
    conn: Option<PoolConnection<Postgres>>,
    acquired_at: Instant,
    metrics: Arc<PoolMetrics>,
}

impl RelationalHandle {
    /// Age of this borrow
    pub fn age(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    /// Remove the connection from the pool for disposal instead of returning
    /// it; used after a failed validation check.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            // Detached connections close on drop rather than re-entering the pool
            let _ = conn.detach();
            self.metrics.record_closed();
        }
    }
}

impl Deref for RelationalHandle {
    type Target = PoolConnection<Postgres>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for RelationalHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for RelationalHandle {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.metrics.record_released();
        }
    }
}
