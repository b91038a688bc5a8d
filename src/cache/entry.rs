//! Individual cache entry with access metadata.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// One cached value.
///
/// Immutable after insertion except for the access counter and last-access
/// instant, which are only updated under the owning layer's lock. The size is
/// the measured serialized size of the payload, never an estimate.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cached payload
    pub value: Value,

    /// Creation instant
    pub created_at: Instant,

    /// Expiry instant; always after `created_at`
    pub expires_at: Instant,

    /// Number of hits served from this entry
    pub access_count: u64,

    /// Instant of the most recent hit
    pub last_accessed: Instant,

    /// Measured serialized size in bytes; always positive
    pub size: usize,

    /// Warmed entries are excluded from eviction until they expire
    pub hot: bool,
}

impl CacheEntry {
    /// Create an entry with the given time-to-live
    pub fn new(value: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        let size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(1).max(1);
        Self {
            value,
            created_at: now,
            expires_at: now + ttl.max(Duration::from_millis(1)),
            access_count: 0,
            last_accessed: now,
            size,
            hot: false,
        }
    }

    /// Create a hot (warm) entry
    pub fn new_hot(value: Value, ttl: Duration) -> Self {
        let mut entry = Self::new(value, ttl);
        entry.hot = true;
        entry
    }

    /// Whether the entry's TTL has elapsed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Record a hit
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }

    /// Age since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_is_measured() {
        let entry = CacheEntry::new(json!({"text": "hello"}), Duration::from_secs(60));
        assert_eq!(entry.size, serde_json::to_vec(&json!({"text": "hello"})).unwrap().len());
        assert!(entry.size > 0);
    }

    #[test]
    fn test_expiry_follows_creation() {
        let entry = CacheEntry::new(json!(1), Duration::from_secs(0));
        assert!(entry.expires_at > entry.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let entry = CacheEntry::new(json!("v"), Duration::from_secs(60));
        assert!(!entry.is_expired());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(entry.is_expired());
    }

    #[test]
    fn test_touch_updates_counter() {
        let mut entry = CacheEntry::new(json!("v"), Duration::from_secs(60));
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count, 2);
    }
}
