//! Result cache collaborator.
//!
//! The orchestrator memoizes retrieval results through `ResultCache`; the
//! in-process implementation is an LRU with a per-entry TTL.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);

    /// Drop every entry whose key starts with `prefix`
    async fn invalidate_prefix(&self, prefix: &str);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// LRU-based cache with TTL
pub struct MemoryCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create new cache holding at most `capacity` keys (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Prune expired entries (called periodically)
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();

        let expired_keys = Self::keys_matching(&cache, |_, entry| now >= entry.expires_at);

        for key in expired_keys {
            cache.pop(&key);
        }
    }

    fn keys_matching<F>(cache: &LruCache<String, CacheEntry>, pred: F) -> Vec<String>
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        cache
            .iter()
            .filter(|(key, entry)| pred(key, entry))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Get current cache size
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut cache = self.cache.lock().await;

        if let Some(entry) = cache.get(key) {
            if Instant::now() < entry.expires_at {
                return Some(entry.value.clone());
            }
            // Expired, remove
            cache.pop(key);
        }
        None
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut cache = self.cache.lock().await;
        cache.put(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        let mut cache = self.cache.lock().await;
        for key in Self::keys_matching(&cache, |key, _| key.starts_with(prefix)) {
            cache.pop(&key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        // Default: 1,000 keys
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = MemoryCache::new(10);
        assert!(cache.get("knowledge:none").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_hit() {
        let cache = MemoryCache::new(10);
        cache
            .set("knowledge:q", b"[\"doc\"]".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("knowledge:q").await, Some(b"[\"doc\"]".to_vec()));
    }

    #[tokio::test]
    async fn test_cache_expiration() {
        let cache = MemoryCache::new(10);
        cache
            .set("key1", vec![1], Duration::from_millis(50))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.get("key1").await.is_none(), "Key should have expired");
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_cache_lru_eviction() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);

        cache.set("key1", vec![1], ttl).await;
        cache.set("key2", vec![2], ttl).await;
        cache.set("key3", vec![3], ttl).await; // Should evict key1

        assert!(cache.get("key1").await.is_none());
        assert_eq!(cache.get("key2").await, Some(vec![2]));
        assert_eq!(cache.get("key3").await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.set("knowledge:water?", b"[]".to_vec(), ttl).await;
        cache.set("knowledge:pests", b"[]".to_vec(), ttl).await;
        cache.set("other:pests", vec![1], ttl).await;

        cache.invalidate_prefix("knowledge:").await;

        assert!(cache.get("knowledge:water?").await.is_none());
        assert!(cache.get("knowledge:pests").await.is_none());
        assert_eq!(cache.get("other:pests").await, Some(vec![1]));
    }

    #[tokio::test]
    async fn test_prune_expired() {
        let cache = MemoryCache::new(10);
        cache.set("short", vec![1], Duration::from_millis(10)).await;
        cache.set("long", vec![2], Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.prune_expired().await;
        assert_eq!(cache.len().await, 1);
    }
}
