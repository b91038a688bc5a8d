//! End-to-end cache scenarios over the multi-layer facade (L1-only: the
//! remote layer degrades silently when no key-value client is configured).

use std::time::Duration;

use engram::cache::{key, CacheConfig, L1Cache, MultiLayerCache};
use serde_json::json;

fn l1_only(l1_max_bytes: usize, l1_ttl: Duration) -> MultiLayerCache {
    let config = CacheConfig {
        l1_max_bytes,
        l1_ttl,
        ..CacheConfig::default()
    };
    MultiLayerCache::new(&config, None)
}

/// JSON string whose serialized form is exactly `bytes` long
fn value_of_size(bytes: usize) -> serde_json::Value {
    json!("x".repeat(bytes - 2))
}

#[tokio::test]
async fn basic_cache_round_trip() {
    let cache = l1_only(1024 * 1024, Duration::from_secs(60));

    cache
        .set("memory:user:u1:m1", json!({"text": "hi"}), None)
        .await;
    assert_eq!(
        cache.get("memory:user:u1:m1").await,
        Some(json!({"text": "hi"}))
    );

    let stats = cache.stats().await;
    assert_eq!(stats.l1.evictions, 0);
    assert_eq!(stats.requests, 1);
    assert!((stats.overall_hit_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn lru_eviction_by_bytes() {
    let l1 = L1Cache::new(1024, Duration::from_secs(60));

    for i in 1..=5 {
        l1.set(&format!("k{i}"), value_of_size(300), None).await;
    }

    // Five 300-byte inserts under a 1 KiB cap: K1 and K2 evicted, in order
    assert_eq!(l1.get("k1").await, None);
    assert_eq!(l1.get("k2").await, None);
    assert!(l1.get("k3").await.is_some());
    assert!(l1.get("k4").await.is_some());
    assert!(l1.get("k5").await.is_some());
    assert_eq!(l1.stats().await.evictions, 2);
}

#[tokio::test]
async fn per_user_invalidation() {
    let cache = l1_only(1024 * 1024, Duration::from_secs(60));

    cache.set("memory:user:u1:a", json!("a"), None).await;
    cache.set("memory:user:u1:b", json!("b"), None).await;
    cache.set("memory:user:u2:c", json!("c"), None).await;

    cache.invalidate_user("u1").await;

    assert_eq!(cache.get("memory:user:u1:a").await, None);
    assert_eq!(cache.get("memory:user:u1:b").await, None);
    assert_eq!(cache.get("memory:user:u2:c").await, Some(json!("c")));
}

#[tokio::test]
async fn invalidation_does_not_touch_similar_user_ids() {
    let cache = l1_only(1024 * 1024, Duration::from_secs(60));

    cache.set("memory:user:u1:a", json!(1), None).await;
    cache.set("memory:user:u11:a", json!(2), None).await;

    cache.invalidate_user("u1").await;

    assert_eq!(cache.get("memory:user:u1:a").await, None);
    assert_eq!(cache.get("memory:user:u11:a").await, Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn ttl_expiry_counts_one_miss() {
    let cache = l1_only(1024 * 1024, Duration::from_secs(60));
    cache.set("memory:user:u1:m", json!("v"), None).await;

    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(cache.get("memory:user:u1:m").await, None);
    let stats = cache.stats().await;
    assert_eq!(stats.l1.misses, 1);
    assert_eq!(stats.l1.entries, 0);
}

#[tokio::test]
async fn query_cache_round_trip_and_user_invalidation() {
    let cache = l1_only(1024 * 1024, Duration::from_secs(60));
    let query = "SELECT id, content FROM memories WHERE user_id = $1 ORDER BY created_at";

    cache
        .cache_query_result(query, &json!(["u1"]), json!([{"id": "m1"}]), None)
        .await;
    assert_eq!(
        cache.get_query_result(query, &json!(["u1"])).await,
        Some(json!([{"id": "m1"}]))
    );

    // Writes to a user's memories invalidate registered per-user queries
    cache.invalidate_user("u1").await;
    assert_eq!(cache.get_query_result(query, &json!(["u1"])).await, None);
}

#[tokio::test]
async fn canonical_keys_are_order_independent() {
    let cache = l1_only(1024 * 1024, Duration::from_secs(60));

    let key_a = key::user_key("search", "u1", &json!({"limit": 5, "tag": "work"}));
    let key_b = key::user_key("search", "u1", &json!({"tag": "work", "limit": 5}));
    assert_eq!(key_a, key_b);

    cache.set(&key_a, json!(["m1"]), None).await;
    assert_eq!(cache.get(&key_b).await, Some(json!(["m1"])));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, usize),
        Get(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), 50usize..400).prop_map(|(k, s)| Op::Put(k, s)),
            any::<u8>().prop_map(Op::Get),
        ]
    }

    proptest! {
        /// The sum of cached entry sizes never exceeds the configured cap,
        /// whatever the sequence of gets and puts.
        #[test]
        fn l1_byte_bound_holds(ops in proptest::collection::vec(op_strategy(), 1..120)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let cap = 1000usize;
                let l1 = L1Cache::new(cap, Duration::from_secs(60));
                for op in ops {
                    match op {
                        Op::Put(k, size) => {
                            l1.set(&format!("k{k}"), value_of_size(size), None).await;
                        }
                        Op::Get(k) => {
                            l1.get(&format!("k{k}")).await;
                        }
                    }
                    prop_assert!(l1.bytes().await <= cap);
                }
                Ok(())
            })?;
        }

        /// After any access sequence, eviction removes the least recently
        /// used entries: everything touched more recently than the newest
        /// evicted entry stays resident.
        #[test]
        fn l1_evicts_least_recently_used(touch in proptest::collection::vec(0u8..6, 0..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let l1 = L1Cache::new(1000, Duration::from_secs(60));
                for k in 0..3u8 {
                    l1.set(&format!("k{k}"), value_of_size(300), None).await;
                }
                // Recency order after the touches
                let mut order: Vec<u8> = vec![0, 1, 2];
                for k in touch {
                    let k = k % 3;
                    if l1.get(&format!("k{k}")).await.is_some() {
                        order.retain(|x| *x != k);
                        order.push(k);
                    }
                }

                // A fourth insert must evict exactly the head of the order
                l1.set("fresh", value_of_size(300), None).await;
                let victim = order[0];
                let victim_key = format!("k{}", victim);
                let victim_absent = l1.get(&victim_key).await.is_none();
                prop_assert!(victim_absent);
                for survivor in &order[1..] {
                    let survivor_key = format!("k{}", survivor);
                    let survivor_present = l1.get(&survivor_key).await.is_some();
                    prop_assert!(survivor_present);
                }
                Ok(())
            })?;
        }
    }
}
