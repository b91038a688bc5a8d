//! L3 parameterised query-result cache.
//!
//! Results are keyed by the hash of the (query text, parameter tuple) pair.
//! The layer also registers the distinct query texts it has seen — a bounded
//! "prepared" registry the relational pool can use to keep a matching
//! server-side prepared statement cache warm.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::logging::Logger;

use super::entry::CacheEntry;
use super::key::{query_key, statement_key};

const LOGGER: Logger = Logger::new("cache");

/// Cleanup removes the oldest 10% of the registry per pass...
const CLEANUP_FRACTION: usize = 10;
/// ...but never more than this many statements at once
const CLEANUP_MAX: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
struct L3Counters {
    hits: u64,
    misses: u64,
    invalidations: u64,
    statements_registered: u64,
    statements_cleaned: u64,
}

struct CachedResult {
    statement: String,
    entry: CacheEntry,
}

struct L3Inner {
    results: HashMap<String, CachedResult>,
    statements: HashMap<String, String>,
    statement_order: VecDeque<String>,
    counters: L3Counters,
}

/// Point-in-time L3 statistics
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct L3Stats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub cached_results: usize,
    pub prepared_statements: usize,
    pub statements_cleaned: u64,
    pub hit_rate: f64,
}

/// Query-result cache with a bounded prepared-statement registry
pub struct L3QueryCache {
    default_ttl: Duration,
    max_prepared: usize,
    inner: Mutex<L3Inner>,
}

impl L3QueryCache {
    /// Create the cache with the given default TTL and registry cap
    pub fn new(default_ttl: Duration, max_prepared: usize) -> Self {
        Self {
            default_ttl,
            max_prepared: max_prepared.max(1),
            inner: Mutex::new(L3Inner {
                results: HashMap::new(),
                statements: HashMap::new(),
                statement_order: VecDeque::new(),
                counters: L3Counters::default(),
            }),
        }
    }

    /// Cached result for a (query, params) pair, if fresh
    pub async fn get_query_result(&self, query: &str, params: &Value) -> Option<Value> {
        let cache_key = query_key(query, params);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.results.get_mut(&cache_key) {
            Some(cached) if !cached.entry.is_expired() => {
                cached.entry.touch();
                inner.counters.hits += 1;
                Some(cached.entry.value.clone())
            }
            Some(_) => {
                inner.results.remove(&cache_key);
                inner.counters.misses += 1;
                None
            }
            None => {
                inner.counters.misses += 1;
                None
            }
        }
    }

    /// Cache a query result and register its statement text
    pub async fn cache_query_result(
        &self,
        query: &str,
        params: &Value,
        result: Value,
        ttl: Option<Duration>,
    ) {
        let cache_key = query_key(query, params);
        let stmt_key = statement_key(query);

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if !inner.statements.contains_key(&stmt_key) {
            inner.statements.insert(stmt_key.clone(), query.to_string());
            inner.statement_order.push_back(stmt_key.clone());
            inner.counters.statements_registered += 1;
        }

        inner.results.insert(
            cache_key,
            CachedResult {
                statement: stmt_key,
                entry: CacheEntry::new(result, ttl.unwrap_or(self.default_ttl)),
            },
        );

        if inner.statements.len() > self.max_prepared {
            Self::cleanup_statements(inner, self.max_prepared);
        }
    }

    /// Bounded registry cleanup: drop the oldest 10%, at most 100 per pass
    fn cleanup_statements(inner: &mut L3Inner, max_prepared: usize) {
        let total = inner.statements.len();
        if total <= max_prepared {
            return;
        }

        let cleanup_count = (total / CLEANUP_FRACTION).clamp(1, CLEANUP_MAX);
        let mut cleaned = 0usize;
        while cleaned < cleanup_count {
            match inner.statement_order.pop_front() {
                Some(stmt_key) => {
                    if inner.statements.remove(&stmt_key).is_some() {
                        cleaned += 1;
                    }
                }
                None => break,
            }
        }

        inner.counters.statements_cleaned += cleaned as u64;
        LOGGER.info(
            "cleaned up prepared statement registry",
            &[
                ("removed", json!(cleaned)),
                ("remaining", json!(inner.statements.len())),
            ],
        );
    }

    /// Drop every cached result whose registered query touches the table
    pub async fn invalidate_table(&self, table: &str) -> usize {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let touched: Vec<String> = inner
            .statements
            .iter()
            .filter(|(_, text)| text.contains(table))
            .map(|(key, _)| key.clone())
            .collect();

        let before = inner.results.len();
        inner
            .results
            .retain(|_, cached| !touched.contains(&cached.statement));
        let removed = before - inner.results.len();

        inner.counters.invalidations += removed as u64;
        LOGGER.debug(
            "invalidated query results for table",
            &[("table", json!(table)), ("removed", json!(removed))],
        );
        removed
    }

    /// Drop every cached result
    pub async fn clear(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let removed = guard.results.len();
        guard.results.clear();
        guard.counters.invalidations += removed as u64;
        removed
    }

    /// Registered query texts, oldest first; consumed by the relational pool
    /// to warm its server-side prepared statement cache
    pub async fn prepared_statements(&self) -> Vec<String> {
        let guard = self.inner.lock().await;
        guard
            .statement_order
            .iter()
            .filter_map(|key| guard.statements.get(key).cloned())
            .collect()
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> L3Stats {
        let guard = self.inner.lock().await;
        let total = guard.counters.hits + guard.counters.misses;
        L3Stats {
            hits: guard.counters.hits,
            misses: guard.counters.misses,
            invalidations: guard.counters.invalidations,
            cached_results: guard.results.len(),
            prepared_statements: guard.statements.len(),
            statements_cleaned: guard.counters.statements_cleaned,
            hit_rate: guard.counters.hits as f64 / total.max(1) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const QUERY: &str = "SELECT id, content FROM memories WHERE user_id = $1";

    #[tokio::test]
    async fn test_result_round_trip() {
        let l3 = L3QueryCache::new(Duration::from_secs(1800), 1000);
        let params = json!(["u1"]);

        assert_eq!(l3.get_query_result(QUERY, &params).await, None);
        l3.cache_query_result(QUERY, &params, json!([{"id": 1}]), None)
            .await;
        assert_eq!(
            l3.get_query_result(QUERY, &params).await,
            Some(json!([{"id": 1}]))
        );

        let stats = l3.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.prepared_statements, 1);
    }

    #[tokio::test]
    async fn test_params_distinguish_results() {
        let l3 = L3QueryCache::new(Duration::from_secs(1800), 1000);
        l3.cache_query_result(QUERY, &json!(["u1"]), json!("a"), None).await;
        l3.cache_query_result(QUERY, &json!(["u2"]), json!("b"), None).await;

        assert_eq!(l3.get_query_result(QUERY, &json!(["u1"])).await, Some(json!("a")));
        assert_eq!(l3.get_query_result(QUERY, &json!(["u2"])).await, Some(json!("b")));
        // Same statement registered once
        assert_eq!(l3.stats().await.prepared_statements, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_result_is_miss() {
        let l3 = L3QueryCache::new(Duration::from_secs(60), 1000);
        l3.cache_query_result(QUERY, &json!(["u1"]), json!("a"), None).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(l3.get_query_result(QUERY, &json!(["u1"])).await, None);
        assert_eq!(l3.stats().await.cached_results, 0);
    }

    #[tokio::test]
    async fn test_table_invalidation_targets_registered_queries() {
        let l3 = L3QueryCache::new(Duration::from_secs(1800), 1000);
        l3.cache_query_result(QUERY, &json!(["u1"]), json!("a"), None).await;
        l3.cache_query_result("SELECT 1 FROM settings", &json!([]), json!("s"), None)
            .await;

        assert_eq!(l3.invalidate_table("memories").await, 1);
        assert_eq!(l3.get_query_result(QUERY, &json!(["u1"])).await, None);
        assert_eq!(
            l3.get_query_result("SELECT 1 FROM settings", &json!([])).await,
            Some(json!("s"))
        );
    }

    #[tokio::test]
    async fn test_registry_cleanup_is_bounded() {
        let l3 = L3QueryCache::new(Duration::from_secs(1800), 200);
        for i in 0..=200 {
            let q = format!("SELECT {i} FROM memories");
            l3.cache_query_result(&q, &json!([]), json!(i), None).await;
        }

        let stats = l3.stats().await;
        // One pass removed 10% of 201 = 20 statements
        assert_eq!(stats.statements_cleaned, 20);
        assert_eq!(stats.prepared_statements, 181);

        // Oldest statements were the ones dropped
        let remaining = l3.prepared_statements().await;
        assert!(!remaining.contains(&"SELECT 0 FROM memories".to_string()));
        assert!(remaining.contains(&"SELECT 200 FROM memories".to_string()));
    }
}
