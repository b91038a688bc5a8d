//! L2 remote key-value cache layer.
//!
//! Values are encoded with a compact self-describing binary format
//! (MessagePack), so round-tripped values keep their numeric and boolean
//! types. Transport errors never reach the caller: the layer degrades to
//! L1-only semantics and bumps a fallback counter.

use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde_json::{json, Value};

use crate::logging::Logger;

use super::key::user_scope_fragment;

const LOGGER: Logger = Logger::new("cache");

/// Keys examined per SCAN page during invalidation
const SCAN_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
struct L2Counters {
    hits: u64,
    misses: u64,
    errors: u64,
    fallbacks: u64,
    invalidations: u64,
}

/// Point-in-time L2 statistics
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct L2Stats {
    pub connected: bool,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// Remote cache layer over the key-value store
pub struct L2Cache {
    client: Option<ConnectionManager>,
    default_ttl: Duration,
    counters: Mutex<L2Counters>,
}

impl L2Cache {
    /// Create the layer over an already-connected client; `None` disables the
    /// layer entirely (L1-only operation).
    pub fn new(client: Option<ConnectionManager>, default_ttl: Duration) -> Self {
        if client.is_none() {
            LOGGER.warn("L2 cache disabled, operating L1-only", &[]);
        }
        Self {
            client,
            default_ttl,
            counters: Mutex::new(L2Counters::default()),
        }
    }

    fn record_failure(&self, op: &str, err: &redis::RedisError) {
        let mut counters = self.counters.lock();
        counters.errors += 1;
        counters.fallbacks += 1;
        LOGGER.warn(
            "L2 operation failed, degrading to L1-only",
            &[("op", json!(op)), ("error", json!(err.to_string()))],
        );
    }

    /// Look up a key. Misses and transport failures both return `None`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut client = match &self.client {
            Some(client) => client.clone(),
            None => {
                self.counters.lock().fallbacks += 1;
                return None;
            }
        };

        let bytes: Option<Vec<u8>> = match redis::cmd("GET")
            .arg(key)
            .query_async(&mut client)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                self.record_failure("get", &err);
                return None;
            }
        };

        match bytes {
            Some(bytes) => match rmp_serde::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    self.counters.lock().hits += 1;
                    Some(value)
                }
                Err(err) => {
                    // A corrupt entry is treated as a miss and dropped
                    LOGGER.warn(
                        "L2 entry decode failed, dropping key",
                        &[("key", json!(key)), ("error", json!(err.to_string()))],
                    );
                    self.counters.lock().errors += 1;
                    let _ = redis::cmd("DEL")
                        .arg(key)
                        .query_async::<_, ()>(&mut client)
                        .await;
                    None
                }
            },
            None => {
                self.counters.lock().misses += 1;
                None
            }
        }
    }

    /// Store a value with a TTL. Returns `false` on transport failure.
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> bool {
        let mut client = match &self.client {
            Some(client) => client.clone(),
            None => {
                self.counters.lock().fallbacks += 1;
                return false;
            }
        };

        let payload = match rmp_serde::to_vec(value) {
            Ok(payload) => payload,
            Err(err) => {
                LOGGER.warn(
                    "L2 encode failed",
                    &[("key", json!(key)), ("error", json!(err.to_string()))],
                );
                self.counters.lock().errors += 1;
                return false;
            }
        };

        let ttl_secs = ttl.unwrap_or(self.default_ttl).as_secs().max(1);
        match redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(payload)
            .query_async::<_, ()>(&mut client)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.record_failure("set", &err);
                false
            }
        }
    }

    /// Delete every key belonging to the user with a bounded cursor scan,
    /// deleting in chunks; never a blocking all-keys command.
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        let mut client = match &self.client {
            Some(client) => client.clone(),
            None => return 0,
        };

        let pattern = format!("*{}*", user_scope_fragment(user_id));
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let page: (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut client)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.record_failure("scan", &err);
                    break;
                }
            };

            let (next_cursor, keys) = page;
            if !keys.is_empty() {
                match redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, u64>(&mut client)
                    .await
                {
                    Ok(count) => deleted += count,
                    Err(err) => {
                        self.record_failure("del", &err);
                        break;
                    }
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        self.counters.lock().invalidations += deleted;
        LOGGER.debug(
            "invalidated user entries from L2",
            &[("user_id", json!(user_id)), ("removed", json!(deleted))],
        );
        deleted
    }

    /// Whether the remote layer is configured
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> L2Stats {
        let counters = *self.counters.lock();
        let total = counters.hits + counters.misses;
        L2Stats {
            connected: self.client.is_some(),
            hits: counters.hits,
            misses: counters.misses,
            errors: counters.errors,
            fallbacks: counters.fallbacks,
            invalidations: counters.invalidations,
            hit_rate: counters.hits as f64 / total.max(1) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_disabled_layer_counts_fallbacks() {
        let l2 = L2Cache::new(None, Duration::from_secs(3600));
        assert_eq!(l2.get("memory:user:u1:a").await, None);
        assert!(!l2.set("memory:user:u1:a", &json!(1), None).await);
        assert_eq!(l2.invalidate_user("u1").await, 0);

        let stats = l2.stats();
        assert!(!stats.connected);
        assert_eq!(stats.fallbacks, 2);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_binary_encoding_preserves_types() {
        let original = json!({"count": 7, "score": 0.5, "flag": true, "name": "m"});
        let bytes = rmp_serde::to_vec(&original).unwrap();
        let decoded: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded["count"], json!(7));
        assert_eq!(decoded["score"], json!(0.5));
        assert_eq!(decoded["flag"], json!(true));
        // Compact: well under the JSON text size for typical payloads
        assert!(bytes.len() < original.to_string().len());
    }
}
