//! L1 in-process LRU cache with byte accounting.

use std::time::Duration;

use lru::LruCache;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::logging::Logger;

use super::entry::CacheEntry;
use super::key::user_scope_fragment;

const LOGGER: Logger = Logger::new("cache");

#[derive(Debug, Clone, Copy, Default)]
struct L1Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    warmings: u64,
}

struct L1Inner {
    entries: LruCache<String, CacheEntry>,
    current_bytes: usize,
    hot_count: usize,
    counters: L1Counters,
}

/// Point-in-time L1 statistics
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct L1Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub warmings: u64,
    pub entries: usize,
    pub bytes: usize,
    pub hot_keys: usize,
    pub hit_rate: f64,
}

/// In-process LRU cache bounded by total byte size, not entry count.
///
/// The recency list and the map are the same structure (`LruCache`) kept
/// under a single async mutex; every hit promotes the entry to the recency
/// tail. Warmed entries are excluded from eviction until they expire — except
/// when nothing evictable remains, because the byte cap is a hard invariant.
pub struct L1Cache {
    max_bytes: usize,
    default_ttl: Duration,
    inner: Mutex<L1Inner>,
}

impl L1Cache {
    /// Create a cache with the given byte cap and default TTL
    pub fn new(max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            max_bytes,
            default_ttl,
            inner: Mutex::new(L1Inner {
                entries: LruCache::unbounded(),
                current_bytes: 0,
                hot_count: 0,
                counters: L1Counters::default(),
            }),
        }
    }

    /// Look up a key, promoting it on hit. Expired entries are removed
    /// lazily and count as misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.entries.get_mut(key) {
            None => {
                inner.counters.misses += 1;
                None
            }
            Some(entry) if !entry.is_expired() => {
                entry.touch();
                inner.counters.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                if let Some(old) = inner.entries.pop(key) {
                    inner.current_bytes -= old.size;
                    if old.hot {
                        inner.hot_count -= 1;
                    }
                }
                inner.counters.misses += 1;
                None
            }
        }
    }

    /// Insert a value, evicting least-recently-used entries until it fits.
    /// Returns `false` when the value alone exceeds the byte cap.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let entry = CacheEntry::new(value, ttl.unwrap_or(self.default_ttl));
        self.insert(key, entry).await
    }

    /// Insert a hot entry, excluded from eviction until its TTL elapses
    pub async fn warm(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let entry = CacheEntry::new_hot(value, ttl.unwrap_or(self.default_ttl));
        let inserted = self.insert(key, entry).await;
        if inserted {
            self.inner.lock().await.counters.warmings += 1;
        }
        inserted
    }

    async fn insert(&self, key: &str, entry: CacheEntry) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if entry.size > self.max_bytes {
            LOGGER.debug(
                "value larger than the L1 byte cap, not cached",
                &[("key", json!(key)), ("bytes", json!(entry.size))],
            );
            return false;
        }

        if let Some(old) = inner.entries.pop(key) {
            inner.current_bytes -= old.size;
            if old.hot {
                inner.hot_count -= 1;
            }
        }

        let budget = self.max_bytes - entry.size;

        // Evict from the LRU end; hot unexpired entries are set aside.
        let mut kept: Vec<(String, CacheEntry)> = Vec::new();
        let mut kept_bytes = 0usize;
        while inner.current_bytes > budget.saturating_sub(kept_bytes) {
            match inner.entries.pop_lru() {
                None => break,
                Some((evicted_key, evicted)) => {
                    inner.current_bytes -= evicted.size;
                    if evicted.hot && !evicted.is_expired() {
                        kept_bytes += evicted.size;
                        kept.push((evicted_key, evicted));
                    } else {
                        if evicted.hot {
                            inner.hot_count -= 1;
                        }
                        inner.counters.evictions += 1;
                        LOGGER.debug("evicted entry", &[("key", json!(evicted_key))]);
                    }
                }
            }
        }

        // Only hot entries remain and the budget is still exceeded: the byte
        // cap wins, oldest hot entries go first.
        while inner.current_bytes + kept_bytes > budget && !kept.is_empty() {
            let (_, dropped) = kept.remove(0);
            kept_bytes -= dropped.size;
            inner.hot_count -= 1;
            inner.counters.evictions += 1;
        }

        // Survivors re-enter LRU-end first, preserving their relative order
        for (kept_key, kept_entry) in kept {
            inner.entries.put(kept_key, kept_entry);
        }
        inner.current_bytes += kept_bytes;

        if entry.hot {
            inner.hot_count += 1;
        }
        inner.current_bytes += entry.size;
        inner.entries.put(key.to_string(), entry);
        true
    }

    /// Remove a key
    pub async fn remove(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match inner.entries.pop(key) {
            Some(old) => {
                inner.current_bytes -= old.size;
                if old.hot {
                    inner.hot_count -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose key belongs to the user; returns the count
    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        let fragment = user_scope_fragment(user_id);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.contains(&fragment))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            if let Some(old) = inner.entries.pop(key) {
                inner.current_bytes -= old.size;
                if old.hot {
                    inner.hot_count -= 1;
                }
            }
        }

        LOGGER.debug(
            "invalidated user entries from L1",
            &[("user_id", json!(user_id)), ("removed", json!(doomed.len()))],
        );
        doomed.len()
    }

    /// Current byte usage
    pub async fn bytes(&self) -> usize {
        self.inner.lock().await.current_bytes
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> L1Stats {
        let inner = self.inner.lock().await;
        let total = inner.counters.hits + inner.counters.misses;
        L1Stats {
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            evictions: inner.counters.evictions,
            warmings: inner.counters.warmings,
            entries: inner.entries.len(),
            bytes: inner.current_bytes,
            hot_keys: inner.hot_count,
            hit_rate: inner.counters.hits as f64 / total.max(1) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value_of_size(bytes: usize) -> Value {
        // JSON string of exactly `bytes` serialized bytes: 2 quotes + payload
        json!("x".repeat(bytes - 2))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = L1Cache::new(1024 * 1024, Duration::from_secs(60));
        assert!(cache.set("memory:user:u1:m1", json!({"text": "hi"}), None).await);
        assert_eq!(
            cache.get("memory:user:u1:m1").await,
            Some(json!({"text": "hi"}))
        );

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_bytes() {
        let cache = L1Cache::new(1024, Duration::from_secs(60));
        for i in 1..=5 {
            cache.set(&format!("k{i}"), value_of_size(300), None).await;
        }

        // 5 * 300 = 1500 > 1024: the two oldest were evicted
        assert_eq!(cache.get("k1").await, None);
        assert_eq!(cache.get("k2").await, None);
        assert!(cache.get("k3").await.is_some());
        assert!(cache.get("k4").await.is_some());
        assert!(cache.get("k5").await.is_some());

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 2);
        assert!(stats.bytes <= 1024);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let cache = L1Cache::new(1000, Duration::from_secs(60));
        cache.set("a", value_of_size(300), None).await;
        cache.set("b", value_of_size(300), None).await;
        cache.set("c", value_of_size(300), None).await;

        // Touch "a" so "b" becomes the LRU victim
        cache.get("a").await;
        cache.set("d", value_of_size(300), None).await;

        assert!(cache.get("a").await.is_some());
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_read_is_single_miss() {
        let cache = L1Cache::new(1024, Duration::from_secs(60));
        cache.set("k", json!("v"), None).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.bytes, 0);
    }

    #[tokio::test]
    async fn test_hot_entries_survive_eviction() {
        let cache = L1Cache::new(1000, Duration::from_secs(60));
        cache.warm("hot", value_of_size(300), None).await;
        cache.set("a", value_of_size(300), None).await;
        cache.set("b", value_of_size(300), None).await;

        // "hot" is the LRU entry but must be skipped
        cache.set("c", value_of_size(300), None).await;

        assert!(cache.get("hot").await.is_some());
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.stats().await.hot_keys, 1);
    }

    #[tokio::test]
    async fn test_byte_cap_beats_hot_entries() {
        let cache = L1Cache::new(700, Duration::from_secs(60));
        cache.warm("h1", value_of_size(300), None).await;
        cache.warm("h2", value_of_size(300), None).await;

        // Nothing evictable but the cap still holds: oldest hot entry goes
        cache.set("n", value_of_size(300), None).await;
        assert!(cache.bytes().await <= 700);
        assert_eq!(cache.get("h1").await, None);
    }

    #[tokio::test]
    async fn test_user_invalidation_scope() {
        let cache = L1Cache::new(1024 * 1024, Duration::from_secs(60));
        cache.set("memory:user:u1:a", json!(1), None).await;
        cache.set("memory:user:u1:b", json!(2), None).await;
        cache.set("memory:user:u2:c", json!(3), None).await;

        assert_eq!(cache.invalidate_user("u1").await, 2);
        assert_eq!(cache.get("memory:user:u1:a").await, None);
        assert_eq!(cache.get("memory:user:u1:b").await, None);
        assert_eq!(cache.get("memory:user:u2:c").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_replace_updates_bytes() {
        let cache = L1Cache::new(1024, Duration::from_secs(60));
        cache.set("k", value_of_size(300), None).await;
        cache.set("k", value_of_size(100), None).await;
        assert_eq!(cache.bytes().await, 100);
        assert_eq!(cache.stats().await.entries, 1);
    }
}
