//! Keyed, TTL'd cache capability. The gateway consumes it through the
//! [`Cache`] trait so the backing store (memory, remote, two-level, or
//! nothing at all) stays swappable.

pub mod indexed;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

pub use indexed::{CacheEvent, IndexedCache, IndexedCacheConfig, IndexedLoader};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Only the noop cache returns this; callers treat it as a miss.
    #[error("cache is not configured")]
    NotConfigured,
    #[error("key not found")]
    KeyNotFound,
    #[error("cache load failed: {0}")]
    Load(String),
}

#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<V, CacheError>;
    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &K) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
    async fn invalidate(&self, keys: &[K]) -> Result<(), CacheError>;
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// In-memory cache with per-entry TTL and lazy expiry on read.
pub struct MemoryCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    default_ttl: Option<Duration>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Result<V, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.expired() => return Ok(entry.value.clone()),
                Some(_) => {}
                None => return Err(CacheError::KeyNotFound),
            }
        }
        self.entries.write().await.remove(key);
        Err(CacheError::KeyNotFound)
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.or(self.default_ttl);
        self.entries.write().await.insert(
            key,
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn invalidate(&self, keys: &[K]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Stand-in when no cache is configured: reads miss, writes vanish.
pub struct NoopCache;

#[async_trait]
impl<K, V> Cache<K, V> for NoopCache
where
    K: Send + Sync,
    V: Send + Sync,
{
    async fn get(&self, _key: &K) -> Result<V, CacheError> {
        Err(CacheError::NotConfigured)
    }

    async fn set(&self, _key: K, _value: V, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &K) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _keys: &[K]) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Memory fronting a slower remote store. Reads fill the front on a back
/// hit; writes and deletes go to both levels.
pub struct TwoLevelCache<K, V> {
    front: Arc<dyn Cache<K, V>>,
    back: Arc<dyn Cache<K, V>>,
    front_ttl: Option<Duration>,
}

impl<K, V> TwoLevelCache<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
    pub fn new(
        front: Arc<dyn Cache<K, V>>,
        back: Arc<dyn Cache<K, V>>,
        front_ttl: Option<Duration>,
    ) -> Self {
        Self {
            front,
            back,
            front_ttl,
        }
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for TwoLevelCache<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Result<V, CacheError> {
        match self.front.get(key).await {
            Ok(value) => return Ok(value),
            Err(CacheError::KeyNotFound) | Err(CacheError::NotConfigured) => {}
            Err(err) => return Err(err),
        }
        let value = self.back.get(key).await?;
        let _ = self
            .front
            .set(key.clone(), value.clone(), self.front_ttl)
            .await;
        Ok(value)
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.front.set(key.clone(), value.clone(), ttl).await?;
        self.back.set(key, value, ttl).await
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.front.delete(key).await?;
        self.back.delete(key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.front.clear().await?;
        self.back.clear().await
    }

    async fn invalidate(&self, keys: &[K]) -> Result<(), CacheError> {
        self.front.invalidate(keys).await?;
        self.back.invalidate(keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_expires_per_entry() {
        let cache: MemoryCache<String, i32> = MemoryCache::new(None);
        cache
            .set("a".to_string(), 1, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.set("b".to_string(), 2, None).await.unwrap();
        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            cache.get(&"a".to_string()).await.unwrap_err(),
            CacheError::KeyNotFound
        );
        assert_eq!(cache.get(&"b".to_string()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn noop_cache_reports_not_configured() {
        let cache = NoopCache;
        let miss: Result<i32, _> = Cache::<String, i32>::get(&cache, &"x".to_string()).await;
        assert_eq!(miss.unwrap_err(), CacheError::NotConfigured);
        Cache::<String, i32>::set(&cache, "x".to_string(), 1, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_level_fills_the_front_on_back_hit() {
        let front = Arc::new(MemoryCache::<String, i32>::new(None));
        let back = Arc::new(MemoryCache::<String, i32>::new(None));
        back.set("k".to_string(), 7, None).await.unwrap();
        let cache = TwoLevelCache::new(front.clone(), back, None);
        assert_eq!(cache.get(&"k".to_string()).await.unwrap(), 7);
        assert_eq!(front.get(&"k".to_string()).await.unwrap(), 7);
    }
}
