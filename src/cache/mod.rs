//! Multi-layer cache: L1 in-process LRU, L2 remote key-value, L3 query-result.
//!
//! Reads go top-down (L1, then L2 with L1 repopulation); writes go through
//! both L1 and L2. L3 is addressed only through the query-cache API. Any
//! write that mutates a user's persisted memories must call
//! [`MultiLayerCache::invalidate_user`] before resolving the caller's future
//! — that is what gives read-your-writes within a single caller.

mod entry;
pub mod key;
mod l1;
mod l2;
mod l3;

pub use entry::CacheEntry;
pub use l1::{L1Cache, L1Stats};
pub use l2::{L2Cache, L2Stats};
pub use l3::{L3Stats, L3QueryCache};

use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::logging::Logger;

const LOGGER: Logger = Logger::new("cache");

/// The per-user table backing memory rows; written by the write batcher,
/// queried by the vector-search dispatcher.
const USER_TABLE: &str = "memories";

/// Configuration for the three cache layers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 byte cap
    pub l1_max_bytes: usize,

    /// L1 default TTL
    pub l1_ttl: Duration,

    /// Key-value server address for the L2 layer
    pub l2_url: String,

    /// Advisory L2 capacity, validated at load; enforced server-side
    pub l2_max_bytes: u64,

    /// L2 default TTL
    pub l2_ttl: Duration,

    /// L3 default TTL
    pub l3_ttl: Duration,

    /// Prepared-statement registry cap
    pub l3_max_prepared: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_bytes: 256 * 1024 * 1024,
            l1_ttl: Duration::from_secs(300),
            l2_url: "redis://localhost:6379".to_string(),
            l2_max_bytes: 4 * 1024 * 1024 * 1024,
            l2_ttl: Duration::from_secs(3600),
            l3_ttl: Duration::from_secs(1800),
            l3_max_prepared: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct OverallCounters {
    requests: u64,
    l1_hits: u64,
    l2_hits: u64,
    misses: u64,
}

/// Aggregated statistics across every layer
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct CacheStats {
    pub requests: u64,
    pub overall_hit_rate: f64,
    pub l1_hit_share: f64,
    pub l2_hit_share: f64,
    pub l1: L1Stats,
    pub l2: L2Stats,
    pub l3: L3Stats,
}

/// Facade over the three cache layers
pub struct MultiLayerCache {
    l1: L1Cache,
    l2: L2Cache,
    l3: L3QueryCache,
    counters: Mutex<OverallCounters>,
}

impl MultiLayerCache {
    /// Build the cache. The key-value client comes from the pool manager;
    /// `None` runs the cache L1-only.
    pub fn new(config: &CacheConfig, client: Option<ConnectionManager>) -> Self {
        Self {
            l1: L1Cache::new(config.l1_max_bytes, config.l1_ttl),
            l2: L2Cache::new(client, config.l2_ttl),
            l3: L3QueryCache::new(config.l3_ttl, config.l3_max_prepared),
            counters: Mutex::new(OverallCounters::default()),
        }
    }

    /// Read through L1 then L2; an L2 hit repopulates L1
    pub async fn get(&self, cache_key: &str) -> Option<Value> {
        self.counters.lock().requests += 1;

        if let Some(value) = self.l1.get(cache_key).await {
            self.counters.lock().l1_hits += 1;
            return Some(value);
        }

        if let Some(value) = self.l2.get(cache_key).await {
            self.counters.lock().l2_hits += 1;
            self.l1.set(cache_key, value.clone(), None).await;
            return Some(value);
        }

        self.counters.lock().misses += 1;
        None
    }

    /// Write through L1 and L2
    pub async fn set(&self, cache_key: &str, value: Value, ttl: Option<Duration>) {
        self.l1.set(cache_key, value.clone(), ttl).await;
        self.l2.set(cache_key, &value, ttl).await;
    }

    /// Write through both layers and mark the L1 entry hot
    pub async fn warm(&self, cache_key: &str, value: Value, ttl: Option<Duration>) {
        self.l1.warm(cache_key, value.clone(), ttl).await;
        self.l2.set(cache_key, &value, ttl).await;
    }

    /// Pre-populate a user's frequently accessed memories at session start.
    ///
    /// Each memory must carry an `id` field; which memories count as "hot" is
    /// the caller's ranking decision.
    pub async fn warm_user_memories(&self, user_id: &str, memories: &[Value]) -> usize {
        let mut warmed = 0usize;
        for memory in memories {
            let Some(memory_id) = memory.get("id") else {
                continue;
            };
            let cache_key = key::user_key("memory", user_id, &json!({ "id": memory_id }));
            self.warm(&cache_key, memory.clone(), None).await;
            warmed += 1;
        }
        LOGGER.info(
            "warmed user memories",
            &[("user_id", json!(user_id)), ("count", json!(warmed))],
        );
        warmed
    }

    /// Remove every entry belonging to the user from all three layers
    pub async fn invalidate_user(&self, user_id: &str) {
        let l1_removed = self.l1.invalidate_user(user_id).await;
        let l2_removed = self.l2.invalidate_user(user_id).await;
        let l3_removed = self.l3.invalidate_table(USER_TABLE).await;

        LOGGER.info(
            "invalidated user across all cache layers",
            &[
                ("user_id", json!(user_id)),
                ("l1_removed", json!(l1_removed)),
                ("l2_removed", json!(l2_removed)),
                ("l3_removed", json!(l3_removed)),
            ],
        );
    }

    /// Cache a query result (L3 only)
    pub async fn cache_query_result(
        &self,
        query: &str,
        params: &Value,
        result: Value,
        ttl: Option<Duration>,
    ) {
        self.l3.cache_query_result(query, params, result, ttl).await;
    }

    /// Cached query result, if fresh (L3 only)
    pub async fn get_query_result(&self, query: &str, params: &Value) -> Option<Value> {
        self.l3.get_query_result(query, params).await
    }

    /// The query-result layer, for statement warm-up
    pub fn query_cache(&self) -> &L3QueryCache {
        &self.l3
    }

    /// Aggregated statistics
    pub async fn stats(&self) -> CacheStats {
        let counters = *self.counters.lock();
        let hits = counters.l1_hits + counters.l2_hits;
        let requests = counters.requests.max(1) as f64;
        CacheStats {
            requests: counters.requests,
            overall_hit_rate: hits as f64 / requests,
            l1_hit_share: counters.l1_hits as f64 / requests,
            l2_hit_share: counters.l2_hits as f64 / requests,
            l1: self.l1.stats().await,
            l2: self.l2.stats(),
            l3: self.l3.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn l1_only() -> MultiLayerCache {
        MultiLayerCache::new(&CacheConfig::default(), None)
    }

    #[tokio::test]
    async fn test_read_through_and_stats() {
        let cache = l1_only();
        cache.set("memory:user:u1:m1", json!({"text": "hi"}), None).await;

        assert_eq!(
            cache.get("memory:user:u1:m1").await,
            Some(json!({"text": "hi"}))
        );
        assert_eq!(cache.get("memory:user:u1:m2").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.requests, 2);
        assert!((stats.overall_hit_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.l1_hit_share - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalidate_user_spans_layers() {
        let cache = l1_only();
        cache.set("memory:user:u1:a", json!(1), None).await;
        cache.set("memory:user:u2:c", json!(3), None).await;
        cache
            .cache_query_result(
                "SELECT id FROM memories WHERE user_id = $1",
                &json!(["u1"]),
                json!([1]),
                None,
            )
            .await;

        cache.invalidate_user("u1").await;

        assert_eq!(cache.get("memory:user:u1:a").await, None);
        assert_eq!(cache.get("memory:user:u2:c").await, Some(json!(3)));
        assert_eq!(
            cache
                .get_query_result("SELECT id FROM memories WHERE user_id = $1", &json!(["u1"]))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_warm_user_memories_uses_canonical_keys() {
        let cache = l1_only();
        let memories = vec![
            json!({"id": "m1", "text": "likes rust"}),
            json!({"id": "m2", "text": "works remotely"}),
            json!({"text": "no id, skipped"}),
        ];

        assert_eq!(cache.warm_user_memories("u1", &memories).await, 2);

        let cache_key = key::user_key("memory", "u1", &json!({"id": "m1"}));
        assert_eq!(
            cache.get(&cache_key).await,
            Some(json!({"id": "m1", "text": "likes rust"}))
        );
        assert_eq!(cache.stats().await.l1.hot_keys, 2);
    }

    #[tokio::test]
    async fn test_query_results_not_reachable_via_get() {
        let cache = l1_only();
        cache
            .cache_query_result("SELECT 1", &json!([]), json!("r"), None)
            .await;
        let cache_key = key::query_key("SELECT 1", &json!([]));
        assert_eq!(cache.get(&cache_key).await, None);
        assert_eq!(
            cache.get_query_result("SELECT 1", &json!([])).await,
            Some(json!("r"))
        );
    }
}
