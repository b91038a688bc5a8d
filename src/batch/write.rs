//! Memory write batcher.
//!
//! Writes are grouped by principal and inserted inside one relational
//! transaction per principal, returning server-assigned ids in slot order.
//! Each committed principal's cache slice is invalidated before the batch
//! results reach the callers' futures — that ordering is what gives
//! read-your-writes to a single caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use crate::cache::MultiLayerCache;
use crate::errors::{CoreError, Result};
use crate::pool::PoolManager;

use super::processor::{BatchDispatcher, BatchProcessor, BatchTuning, BatcherStats};
use super::request::{BatchPriority, CompletionHandle};

const INSERT_MEMORY: &str = "INSERT INTO memories (user_id, content, metadata, created_at) \
     VALUES ($1, $2, $3, NOW()) RETURNING id";

/// One durable fact to persist
#[derive(Debug, Clone)]
pub struct MemoryWrite {
    /// Owning principal
    pub user_id: String,

    /// Fact text
    pub content: String,

    /// Extraction metadata (categories, confidence, source)
    pub metadata: Value,
}

/// Default tuning for the write batcher
pub fn write_tuning() -> BatchTuning {
    BatchTuning {
        batch_size: 50,
        flush_interval: Duration::from_millis(100),
        workers: 2,
        request_timeout: Duration::from_secs(10),
        ..BatchTuning::default()
    }
}

struct WriteDispatcher {
    pools: Arc<PoolManager>,
    cache: Arc<MultiLayerCache>,
}

impl WriteDispatcher {
    /// Insert one principal's writes in a single transaction, returning ids
    /// in the order given.
    async fn write_user_group(
        &self,
        user_id: &str,
        writes: &[&MemoryWrite],
    ) -> Result<Vec<Uuid>> {
        let mut handle = self.pools.acquire_relational().await?;

        let mut tx = sqlx::Connection::begin(&mut **handle)
            .await
            .map_err(CoreError::from)?;

        let mut ids = Vec::with_capacity(writes.len());
        for write in writes {
            let row = sqlx::query(INSERT_MEMORY)
                .bind(&write.user_id)
                .bind(&write.content)
                .bind(&write.metadata)
                .fetch_one(&mut *tx)
                .await
                .map_err(CoreError::from)?;
            let id: Uuid = row.try_get("id").map_err(CoreError::from)?;
            ids.push(id);
        }

        tx.commit().await.map_err(CoreError::from)?;

        // Invalidation precedes future resolution: the dispatcher returns
        // only after every touched principal's cache slice is gone.
        self.cache.invalidate_user(user_id).await;

        Ok(ids)
    }
}

#[async_trait]
impl BatchDispatcher<MemoryWrite, Uuid> for WriteDispatcher {
    async fn dispatch(&self, requests: &[MemoryWrite]) -> Result<Vec<Result<Uuid>>> {
        // Group slot indices by principal, first-seen order preserved.
        // Batches never mix principals inside one transaction.
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, request) in requests.iter().enumerate() {
            let slots = groups.entry(request.user_id.as_str()).or_insert_with(|| {
                order.push(request.user_id.as_str());
                Vec::new()
            });
            slots.push(index);
        }

        let mut results: Vec<Option<Result<Uuid>>> = (0..requests.len()).map(|_| None).collect();
        for user_id in order {
            let slots = &groups[user_id];
            let writes: Vec<&MemoryWrite> = slots.iter().map(|&i| &requests[i]).collect();

            match self.write_user_group(user_id, &writes).await {
                Ok(ids) => {
                    for (&slot, id) in slots.iter().zip(ids) {
                        results[slot] = Some(Ok(id));
                    }
                }
                Err(err) => {
                    for &slot in slots {
                        results[slot] = Some(Err(err.clone()));
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(CoreError::system("write slot left unresolved")
                        .with_code("MISALIGNED_RESULTS"))
                })
            })
            .collect())
    }
}

/// Batcher for memory writes
pub struct WriteBatcher {
    processor: BatchProcessor<MemoryWrite, Uuid>,
}

impl WriteBatcher {
    /// Create the batcher over the pool and cache facades
    pub fn new(pools: Arc<PoolManager>, cache: Arc<MultiLayerCache>, tuning: BatchTuning) -> Self {
        let dispatcher = Arc::new(WriteDispatcher { pools, cache });
        Self {
            processor: BatchProcessor::new("memory_write", tuning, dispatcher),
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

    /// Enqueue a write; the handle resolves with the server-assigned id
    pub async fn submit(
        &self,
        write: MemoryWrite,
        priority: BatchPriority,
    ) -> Result<CompletionHandle<Uuid>> {
        self.processor.submit(write, priority, None).await
    }

    /// Batcher statistics
    pub fn stats(&self) -> BatcherStats {
        self.processor.stats()
    }
}
