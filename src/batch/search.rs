//! Vector-search batcher.
//!
//! Each worker runs its batch over a single shared pooled connection,
//! executing the per-request similarity queries sequentially and preserving
//! slot order. Requests are heterogeneous enough (principal, filter, limit)
//! that cross-request coalescing is not attempted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::{CoreError, Result};
use crate::pool::PoolManager;

use super::processor::{BatchDispatcher, BatchProcessor, BatchTuning, BatcherStats};
use super::request::{BatchPriority, CompletionHandle};

const SEARCH_MEMORIES: &str = "SELECT id, content, metadata, \
            (embedding <-> $1::vector) AS distance \
     FROM memories \
     WHERE user_id = $2 \
       AND ($3::jsonb IS NULL OR metadata @> $3::jsonb) \
     ORDER BY distance ASC \
     LIMIT $4";

/// One similarity search over a principal's memories
#[derive(Debug, Clone)]
pub struct VectorSearch {
    /// Owning principal
    pub user_id: String,

    /// Query embedding
    pub embedding: Vec<f32>,

    /// Maximum hits returned
    pub limit: i64,

    /// Optional metadata containment filter
    pub metadata_filter: Option<Value>,
}

/// One similarity hit
#[derive(Debug, Clone, Serialize)]
#[allow(missing_docs)]
pub struct SearchHit {
    pub id: Uuid,
    pub content: String,
    pub metadata: Value,
    pub similarity: f64,
}

/// Default tuning for the search batcher
pub fn search_tuning() -> BatchTuning {
    BatchTuning {
        batch_size: 20,
        flush_interval: Duration::from_millis(50),
        workers: 4,
        request_timeout: Duration::from_secs(5),
        ..BatchTuning::default()
    }
}

/// pgvector literal for an embedding, e.g. `[0.1,0.2,0.3]`
fn vector_literal(embedding: &[f32]) -> String {
    let mut literal = String::with_capacity(embedding.len() * 10 + 2);
    literal.push('[');
    for (i, component) in embedding.iter().enumerate() {
        if i > 0 {
            literal.push(',');
        }
        literal.push_str(&component.to_string());
    }
    literal.push(']');
    literal
}

struct SearchDispatcher {
    pools: Arc<PoolManager>,
}

impl SearchDispatcher {
    async fn run_search(
        conn: &mut sqlx::PgConnection,
        search: &VectorSearch,
    ) -> Result<Vec<SearchHit>> {
        if search.embedding.is_empty() {
            return Err(CoreError::validation("query embedding is empty"));
        }

        let rows = sqlx::query(SEARCH_MEMORIES)
            .bind(vector_literal(&search.embedding))
            .bind(&search.user_id)
            .bind(&search.metadata_filter)
            .bind(search.limit)
            .fetch_all(conn)
            .await
            .map_err(CoreError::from)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let distance: f64 = row.try_get("distance").map_err(CoreError::from)?;
            hits.push(SearchHit {
                id: row.try_get("id").map_err(CoreError::from)?,
                content: row.try_get("content").map_err(CoreError::from)?,
                metadata: row.try_get("metadata").map_err(CoreError::from)?,
                similarity: 1.0 - distance,
            });
        }
        Ok(hits)
    }
}

#[async_trait]
impl BatchDispatcher<VectorSearch, Vec<SearchHit>> for SearchDispatcher {
    async fn dispatch(&self, requests: &[VectorSearch]) -> Result<Vec<Result<Vec<SearchHit>>>> {
        // One pooled connection for the whole batch; per-request failures
        // stay in their slot rather than failing the batch.
        let mut handle = self.pools.acquire_relational().await?;

        let mut results = Vec::with_capacity(requests.len());
        for search in requests {
            results.push(Self::run_search(&mut **handle, search).await);
        }
        Ok(results)
    }
}

/// Batcher for vector similarity searches
pub struct SearchBatcher {
    processor: BatchProcessor<VectorSearch, Vec<SearchHit>>,
}

impl SearchBatcher {
    /// Create the batcher over the pool facade
    pub fn new(pools: Arc<PoolManager>, tuning: BatchTuning) -> Self {
        let dispatcher = Arc::new(SearchDispatcher { pools });
        Self {
            processor: BatchProcessor::new("vector_search", tuning, dispatcher),
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

    /// Enqueue a search; the handle resolves with the ranked hits
    pub async fn submit(
        &self,
        search: VectorSearch,
        priority: BatchPriority,
    ) -> Result<CompletionHandle<Vec<SearchHit>>> {
        self.processor.submit(search, priority, None).await
    }

    /// Batcher statistics
    pub fn stats(&self) -> BatcherStats {
        self.processor.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal_shape() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.25]), "[0.5,-1,2.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
