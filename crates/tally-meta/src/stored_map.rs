//! Persisted key/value map with optional per-entry expiry.
//!
//! The whole map lives under a single backing-store key as a JSON array of
//! `[key, {value, expires_at?}]` pairs. It is hydrated lazily on first access
//! (exactly once, even under concurrent first callers) and every mutation is
//! written through before the call returns. Expired entries are dropped the
//! first time a read observes them; there is no background sweeper.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::types::{MetaStore, MetaStoreExt};

/// Wall-clock source used for expiry checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backing store: {0:#}")]
    Backend(anyhow::Error),
    #[error("stored map codec: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry<V> {
    value: V,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl<V> StoredEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

type Entries<V> = BTreeMap<String, StoredEntry<V>>;

pub struct StoredMap<V> {
    storage_key: String,
    backend: Arc<dyn MetaStore>,
    entries: OnceCell<Mutex<Entries<V>>>,
    clock: Clock,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for StoredMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredMap")
            .field("storage_key", &self.storage_key)
            .field("backend", &self.backend.kind())
            .field("hydrated", &self.entries.initialized())
            .finish()
    }
}

impl<V> StoredMap<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(storage_key: impl Into<String>, backend: Arc<dyn MetaStore>) -> Self {
        Self {
            storage_key: storage_key.into(),
            backend,
            entries: OnceCell::new(),
            clock: Arc::new(Utc::now),
            _value: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Insert or overwrite `key`. With `ttl`, the entry expires that long from now.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| {
            let now = (self.clock)();
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        let mut entries = self.lock().await?;
        let previous = entries.insert(key.to_string(), StoredEntry { value, expires_at });
        self.commit(&mut entries, vec![(key.to_string(), previous)])
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let mut entries = self.lock().await?;
        let now = (self.clock)();
        match entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        tracing::debug!(storage_key=%self.storage_key, key, "evicting expired entry");
        let previous = entries.remove(key);
        self.commit(&mut entries, vec![(key.to_string(), previous)])
            .await?;
        Ok(None)
    }

    pub async fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.lock().await?;
        let previous = entries.remove(key);
        self.commit(&mut entries, vec![(key.to_string(), previous)])
            .await
    }

    /// Live entries in key order. Expired ones are evicted on the way.
    pub async fn entries(&self) -> Result<Vec<(String, V)>, StoreError> {
        let mut entries = self.lock().await?;
        let now = (self.clock)();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        if !expired.is_empty() {
            tracing::debug!(
                storage_key=%self.storage_key,
                evicted = expired.len(),
                "evicted expired entries"
            );
            let undo = expired
                .into_iter()
                .map(|k| {
                    let previous = entries.remove(&k);
                    (k, previous)
                })
                .collect();
            self.commit(&mut entries, undo).await?;
        }
        Ok(entries
            .iter()
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.lock().await?;
        let undo = std::mem::take(&mut *entries)
            .into_iter()
            .map(|(k, entry)| (k, Some(entry)))
            .collect();
        self.commit(&mut entries, undo).await
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Entries<V>>, StoreError> {
        let cell = self.entries.get_or_try_init(|| self.hydrate()).await?;
        Ok(cell.lock().await)
    }

    async fn hydrate(&self) -> Result<Mutex<Entries<V>>, StoreError> {
        let raw = self
            .backend
            .get_or(&self.storage_key, b"[]".to_vec())
            .await
            .map_err(StoreError::Backend)?;
        let pairs: Vec<(String, StoredEntry<V>)> = serde_json::from_slice(&raw)?;
        tracing::debug!(
            storage_key=%self.storage_key,
            backend = self.backend.kind(),
            entries = pairs.len(),
            "hydrated stored map"
        );
        Ok(Mutex::new(pairs.into_iter().collect()))
    }

    /// Write the map through. If the backend refuses, put back the prior
    /// value of every touched key so memory never runs ahead of storage.
    async fn commit(
        &self,
        entries: &mut Entries<V>,
        undo: Vec<(String, Option<StoredEntry<V>>)>,
    ) -> Result<(), StoreError> {
        let Err(e) = self.persist(entries).await else {
            return Ok(());
        };
        for (key, previous) in undo {
            match previous {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        tracing::warn!(storage_key=%self.storage_key, error=%e, "write-through failed, change rolled back");
        Err(e)
    }

    async fn persist(&self, entries: &Entries<V>) -> Result<(), StoreError> {
        let pairs: Vec<(&String, &StoredEntry<V>)> = entries.iter().collect();
        let bytes = serde_json::to_vec(&pairs)?;
        self.backend
            .put(&self.storage_key, bytes)
            .await
            .map_err(StoreError::Backend)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::Result;

    use super::*;
    use crate::memory::MemoryMetaStore;

    /// Counts backend reads and stalls them briefly so concurrent first
    /// accesses genuinely overlap.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryMetaStore,
        gets: AtomicUsize,
        puts: AtomicUsize,
        refuse_puts: AtomicBool,
    }

    #[async_trait::async_trait]
    impl MetaStore for CountingStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.refuse_puts.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        fn kind(&self) -> &'static str {
            "counting"
        }
    }

    fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<std::sync::Mutex<DateTime<Utc>>>) {
        let now = Arc::new(std::sync::Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (clock, now)
    }

    #[tokio::test]
    async fn test_set_get_overwrite_delete() {
        let map: StoredMap<String> = StoredMap::new("m", Arc::new(MemoryMetaStore::new()));

        assert_eq!(map.get("a").await.unwrap(), None);
        map.set("a", "first".to_string(), None).await.unwrap();
        assert_eq!(map.get("a").await.unwrap().as_deref(), Some("first"));

        map.set("a", "second".to_string(), None).await.unwrap();
        assert_eq!(map.get("a").await.unwrap().as_deref(), Some("second"));
        assert_eq!(map.entries().await.unwrap().len(), 1);

        map.delete("a").await.unwrap();
        assert!(!map.has("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_through_and_rehydrates() {
        let backend = Arc::new(MemoryMetaStore::new());

        let map: StoredMap<u64> = StoredMap::new("counts", backend.clone());
        map.set("x", 1, None).await.unwrap();
        map.set("y", 2, Some(Duration::from_secs(3600))).await.unwrap();

        let raw = backend.get("counts").await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json[0][0], "x");
        assert_eq!(json[0][1]["value"], 1);
        assert!(json[0][1].get("expires_at").is_none());
        assert!(json[1][1]["expires_at"].is_string());

        let restarted: StoredMap<u64> = StoredMap::new("counts", backend);
        assert_eq!(
            restarted.entries().await.unwrap(),
            vec![("x".to_string(), 1), ("y".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted_lazily() {
        let backend = Arc::new(MemoryMetaStore::new());
        let start = Utc::now();
        let (clock, now) = manual_clock(start);
        let map: StoredMap<String> =
            StoredMap::new("ttl", backend.clone()).with_clock(clock);

        map.set("short", "s".to_string(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        map.set("forever", "f".to_string(), None).await.unwrap();

        *now.lock().unwrap() = start + TimeDelta::seconds(5);
        assert!(map.has("short").await.unwrap(), "expiry is strictly after the deadline");

        *now.lock().unwrap() = start + TimeDelta::seconds(6);
        assert_eq!(
            map.entries().await.unwrap(),
            vec![("forever".to_string(), "f".to_string())]
        );

        let raw = backend.get("ttl").await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1, "eviction is persisted");
    }

    #[tokio::test]
    async fn test_get_evicts_expired_entry() {
        let start = Utc::now();
        let (clock, now) = manual_clock(start);
        let map: StoredMap<u8> =
            StoredMap::new("ttl", Arc::new(MemoryMetaStore::new())).with_clock(clock);

        map.set("k", 7, Some(Duration::from_millis(10))).await.unwrap();
        *now.lock().unwrap() = start + TimeDelta::seconds(1);
        assert_eq!(map.get("k").await.unwrap(), None);

        *now.lock().unwrap() = start;
        assert_eq!(map.get("k").await.unwrap(), None, "evicted entry stays gone");
    }

    #[tokio::test]
    async fn test_concurrent_first_access_hydrates_once() {
        let backend = Arc::new(CountingStore::default());
        backend
            .inner
            .put("m", br#"[["a",{"value":1}]]"#.to_vec())
            .await
            .unwrap();

        let map: StoredMap<u32> = StoredMap::new("m", backend.clone());
        let (a, b, c) = tokio::join!(map.get("a"), map.has("a"), map.entries());
        assert_eq!(a.unwrap(), Some(1));
        assert!(b.unwrap());
        assert_eq!(c.unwrap().len(), 1);

        map.get("a").await.unwrap();
        assert_eq!(backend.gets.load(Ordering::SeqCst), 1);
        assert_eq!(backend.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let backend = Arc::new(CountingStore::default());
        let map: StoredMap<u32> = StoredMap::new("m", backend.clone());
        map.set("a", 1, None).await.unwrap();

        backend.refuse_puts.store(true, Ordering::SeqCst);
        assert!(matches!(map.set("a", 2, None).await, Err(StoreError::Backend(_))));
        assert!(matches!(map.set("b", 3, None).await, Err(StoreError::Backend(_))));
        assert!(map.delete("a").await.is_err());
        assert!(map.clear().await.is_err());

        assert_eq!(map.get("a").await.unwrap(), Some(1));
        assert!(!map.has("b").await.unwrap());

        backend.refuse_puts.store(false, Ordering::SeqCst);
        let restarted: StoredMap<u32> = StoredMap::new("m", backend);
        assert_eq!(restarted.entries().await.unwrap(), map.entries().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_entry_until_next_read() {
        let backend = Arc::new(CountingStore::default());
        let start = Utc::now();
        let (clock, now) = manual_clock(start);
        let map: StoredMap<u32> = StoredMap::new("m", backend.clone()).with_clock(clock);
        map.set("k", 1, Some(Duration::from_secs(1))).await.unwrap();

        *now.lock().unwrap() = start + TimeDelta::seconds(2);
        backend.refuse_puts.store(true, Ordering::SeqCst);
        assert!(map.get("k").await.is_err());
        assert!(map.entries().await.is_err());

        backend.refuse_puts.store(false, Ordering::SeqCst);
        assert_eq!(map.get("k").await.unwrap(), None);
        let raw = backend.inner.get("m").await.unwrap().unwrap();
        assert_eq!(raw, b"[]".to_vec());
    }

    #[tokio::test]
    async fn test_corrupt_backing_value_is_codec_error() {
        let backend = Arc::new(MemoryMetaStore::new());
        backend.put("m", b"not json".to_vec()).await.unwrap();
        let map: StoredMap<u32> = StoredMap::new("m", backend);
        assert!(matches!(map.get("a").await, Err(StoreError::Codec(_))));
    }
}
