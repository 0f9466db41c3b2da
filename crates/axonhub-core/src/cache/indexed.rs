//! Indexed cache: a keyed store fed by incremental loads, refreshed on an
//! interval, and optionally nudged by a watcher event bus.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, warn};

use super::CacheError;

/// Invalidation-bus events consumed by the watcher loop.
#[derive(Debug, Clone)]
pub enum CacheEvent<K> {
    /// Something changed upstream; schedule a debounced incremental load.
    Refresh { updated_at: i64 },
    /// Reload immediately, skipping the debounce.
    ForceRefresh,
    InvalidateKeys { keys: Vec<K> },
    ReloadKeys { keys: Vec<K> },
}

/// Loads entries on demand and incrementally since a high watermark.
#[async_trait]
pub trait IndexedLoader<K, V>: Send + Sync {
    async fn load_one(&self, key: &K) -> Result<Option<V>, CacheError>;

    /// Returns entries changed since `watermark` plus the new watermark.
    async fn load_since(&self, watermark: i64) -> Result<(Vec<V>, i64), CacheError>;
}

#[derive(Debug, Clone)]
pub struct IndexedCacheConfig {
    pub refresh_interval: Duration,
    pub entry_ttl: Option<Duration>,
    /// Negative results are cached too, with their own lifetime.
    pub negative_ttl: Duration,
    pub debounce: Duration,
}

impl IndexedCacheConfig {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            entry_ttl: None,
            negative_ttl: Duration::from_secs(30),
            debounce: Duration::from_millis(500),
        }
    }
}

struct Slot<V> {
    /// `None` marks a cached negative lookup.
    value: Option<V>,
    expires_at: Option<Instant>,
}

impl<V> Slot<V> {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

pub type KeyFn<K, V> = Box<dyn Fn(&V) -> K + Send + Sync>;
pub type DeletedFn<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

struct Inner<K, V> {
    entries: RwLock<HashMap<K, Slot<V>>>,
    loader: Arc<dyn IndexedLoader<K, V>>,
    key_fn: KeyFn<K, V>,
    deleted_fn: Option<DeletedFn<V>>,
    watermark: Mutex<i64>,
    loads: Mutex<HashMap<K, Arc<Mutex<()>>>>,
    config: IndexedCacheConfig,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn cached(&self, key: &K) -> Option<Result<V, CacheError>> {
        let entries = self.entries.read().await;
        let slot = entries.get(key)?;
        if slot.expired() {
            return None;
        }
        Some(match &slot.value {
            Some(value) => Ok(value.clone()),
            None => Err(CacheError::KeyNotFound),
        })
    }

    async fn store(&self, key: K, value: Option<V>) {
        let ttl = match value {
            Some(_) => self.config.entry_ttl,
            None => Some(self.config.negative_ttl),
        };
        self.entries.write().await.insert(
            key,
            Slot {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    async fn load_guard(&self, key: &K) -> Arc<Mutex<()>> {
        self.loads
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn get(&self, key: &K) -> Result<V, CacheError> {
        if let Some(result) = self.cached(key).await {
            return result;
        }
        // Single-flight per key: concurrent misses share one load.
        let guard = self.load_guard(key).await;
        let _held = guard.lock().await;
        if let Some(result) = self.cached(key).await {
            return result;
        }
        let loaded = self.loader.load_one(key).await?;
        self.store(key.clone(), loaded.clone()).await;
        loaded.ok_or(CacheError::KeyNotFound)
    }

    async fn apply(&self, values: Vec<V>, new_watermark: i64) {
        let mut entries = self.entries.write().await;
        for value in values {
            let key = (self.key_fn)(&value);
            let deleted = self
                .deleted_fn
                .as_ref()
                .is_some_and(|deleted_fn| deleted_fn(&value));
            if deleted {
                entries.remove(&key);
            } else {
                entries.insert(
                    key,
                    Slot {
                        value: Some(value),
                        expires_at: self.config.entry_ttl.map(|ttl| Instant::now() + ttl),
                    },
                );
            }
        }
        drop(entries);
        let mut watermark = self.watermark.lock().await;
        if new_watermark > *watermark {
            *watermark = new_watermark;
        }
    }

    async fn refresh_once(&self) {
        let since = *self.watermark.lock().await;
        match self.loader.load_since(since).await {
            Ok((values, new_watermark)) => {
                if !values.is_empty() {
                    debug!(count = values.len(), "indexed cache applied updates");
                }
                self.apply(values, new_watermark).await;
            }
            Err(err) => warn!(error = %err, "indexed cache refresh failed"),
        }
    }
}

pub struct IndexedCache<K, V> {
    inner: Arc<Inner<K, V>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<K, V> IndexedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        loader: Arc<dyn IndexedLoader<K, V>>,
        key_fn: KeyFn<K, V>,
        deleted_fn: Option<DeletedFn<V>>,
        config: IndexedCacheConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            entries: RwLock::new(HashMap::new()),
            loader,
            key_fn,
            deleted_fn,
            watermark: Mutex::new(0),
            loads: Mutex::new(HashMap::new()),
            config,
        });
        let cache = Self {
            inner: inner.clone(),
            tasks: std::sync::Mutex::new(Vec::new()),
        };
        let interval = inner.config.refresh_interval;
        let periodic = tokio::spawn({
            let inner = inner.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    inner.refresh_once().await;
                }
            }
        });
        cache.tasks.lock().expect("task list lock").push(periodic);
        cache
    }

    /// Attach the invalidation bus. `Refresh` events are debounced so a
    /// burst of writes costs one incremental load.
    pub fn watch(&self, mut events: broadcast::Receiver<CacheEvent<K>>) {
        let inner = self.inner.clone();
        let debounce = inner.config.debounce;
        let watcher = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        CacheEvent::ForceRefresh
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    CacheEvent::Refresh { .. } => {
                        tokio::time::sleep(debounce).await;
                        // Collapse whatever piled up during the debounce.
                        while let Ok(next) = events.try_recv() {
                            if let CacheEvent::InvalidateKeys { keys } = next {
                                inner.entries.write().await.retain(|key, _| !keys.contains(key));
                            }
                        }
                        inner.refresh_once().await;
                    }
                    CacheEvent::ForceRefresh => inner.refresh_once().await,
                    CacheEvent::InvalidateKeys { keys } => {
                        let mut entries = inner.entries.write().await;
                        for key in keys {
                            entries.remove(&key);
                        }
                    }
                    CacheEvent::ReloadKeys { keys } => {
                        for key in keys {
                            match inner.loader.load_one(&key).await {
                                Ok(value) => inner.store(key, value).await,
                                Err(err) => {
                                    warn!(error = %err, "indexed cache reload failed")
                                }
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("task list lock").push(watcher);
    }

    pub async fn get(&self, key: &K) -> Result<V, CacheError> {
        self.inner.get(key).await
    }

    /// Scan live entries for the first match. The table is small (it holds
    /// admin-managed config rows), so a linear scan is fine.
    pub async fn find<F>(&self, predicate: F) -> Option<V>
    where
        F: Fn(&V) -> bool,
    {
        let entries = self.inner.entries.read().await;
        entries
            .values()
            .filter(|slot| !slot.expired())
            .filter_map(|slot| slot.value.as_ref())
            .find(|value| predicate(value))
            .cloned()
    }

    pub async fn set(&self, value: V) {
        let key = (self.inner.key_fn)(&value);
        self.inner.store(key, Some(value)).await;
    }

    pub async fn refresh_now(&self) {
        self.inner.refresh_once().await;
    }

    /// Stop the periodic refresh and the watcher loop. Idempotent.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
    }
}

impl<K, V> Drop for IndexedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        id: i64,
        name: String,
        deleted: bool,
        updated_at: i64,
    }

    struct ScriptedLoader {
        items: std::sync::Mutex<Vec<Item>>,
        load_one_calls: AtomicUsize,
    }

    impl ScriptedLoader {
        fn new(items: Vec<Item>) -> Arc<Self> {
            Arc::new(Self {
                items: std::sync::Mutex::new(items),
                load_one_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IndexedLoader<i64, Item> for ScriptedLoader {
        async fn load_one(&self, key: &i64) -> Result<Option<Item>, CacheError> {
            self.load_one_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .items
                .lock()
                .unwrap()
                .iter()
                .find(|item| item.id == *key)
                .cloned())
        }

        async fn load_since(&self, watermark: i64) -> Result<(Vec<Item>, i64), CacheError> {
            let items = self.items.lock().unwrap();
            let fresh: Vec<Item> = items
                .iter()
                .filter(|item| item.updated_at > watermark)
                .cloned()
                .collect();
            let new_watermark = items
                .iter()
                .map(|item| item.updated_at)
                .max()
                .unwrap_or(watermark);
            Ok((fresh, new_watermark))
        }
    }

    fn cache_for(loader: Arc<ScriptedLoader>) -> IndexedCache<i64, Item> {
        IndexedCache::new(
            loader,
            Box::new(|item: &Item| item.id),
            Some(Box::new(|item: &Item| item.deleted)),
            IndexedCacheConfig {
                refresh_interval: Duration::from_secs(3600),
                entry_ttl: None,
                negative_ttl: Duration::from_millis(50),
                debounce: Duration::from_millis(5),
            },
        )
    }

    fn item(id: i64, name: &str, updated_at: i64) -> Item {
        Item {
            id,
            name: name.to_string(),
            deleted: false,
            updated_at,
        }
    }

    #[tokio::test]
    async fn get_loads_once_and_caches_negatives() {
        let loader = ScriptedLoader::new(vec![item(1, "one", 1)]);
        let cache = cache_for(loader.clone());
        assert_eq!(cache.get(&1).await.unwrap().name, "one");
        assert_eq!(cache.get(&1).await.unwrap().name, "one");
        assert_eq!(loader.load_one_calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get(&404).await.unwrap_err(), CacheError::KeyNotFound);
        assert_eq!(cache.get(&404).await.unwrap_err(), CacheError::KeyNotFound);
        // The negative result was cached.
        assert_eq!(loader.load_one_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_applies_updates_and_deletes() {
        let loader = ScriptedLoader::new(vec![item(1, "one", 1)]);
        let cache = cache_for(loader.clone());
        assert_eq!(cache.get(&1).await.unwrap().name, "one");

        {
            let mut items = loader.items.lock().unwrap();
            items[0].name = "renamed".to_string();
            items[0].updated_at = 2;
            items.push(Item {
                id: 2,
                name: "two".to_string(),
                deleted: true,
                updated_at: 2,
            });
        }
        cache.refresh_now().await;
        assert_eq!(cache.get(&1).await.unwrap().name, "renamed");
        // The deleted row never lands in the cache; a direct lookup still
        // single-flights through the loader.
        let calls_before = loader.load_one_calls.load(Ordering::SeqCst);
        let _ = cache.get(&2).await;
        assert_eq!(loader.load_one_calls.load(Ordering::SeqCst), calls_before + 1);
    }

    #[tokio::test]
    async fn watcher_refresh_is_debounced() {
        let loader = ScriptedLoader::new(vec![item(1, "one", 1)]);
        let cache = cache_for(loader.clone());
        let (tx, rx) = broadcast::channel(8);
        cache.watch(rx);

        loader.items.lock().unwrap()[0].name = "fresh".to_string();
        loader.items.lock().unwrap()[0].updated_at = 5;
        tx.send(CacheEvent::Refresh { updated_at: 5 }).unwrap();
        tx.send(CacheEvent::Refresh { updated_at: 5 }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&1).await.unwrap().name, "fresh");
        cache.stop();
        cache.stop();
    }

    #[tokio::test]
    async fn watcher_invalidate_and_reload() {
        let loader = ScriptedLoader::new(vec![item(1, "one", 1)]);
        let cache = cache_for(loader.clone());
        let (tx, rx) = broadcast::channel(8);
        cache.watch(rx);
        assert_eq!(cache.get(&1).await.unwrap().name, "one");

        loader.items.lock().unwrap()[0].name = "reloaded".to_string();
        tx.send(CacheEvent::ReloadKeys { keys: vec![1] }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&1).await.unwrap().name, "reloaded");

        tx.send(CacheEvent::InvalidateKeys { keys: vec![1] }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls_before = loader.load_one_calls.load(Ordering::SeqCst);
        assert_eq!(cache.get(&1).await.unwrap().name, "reloaded");
        assert_eq!(loader.load_one_calls.load(Ordering::SeqCst), calls_before + 1);
    }
}
