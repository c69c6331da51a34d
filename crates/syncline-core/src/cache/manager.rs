use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::KeyValueStore;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub stored_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub ttl_millis: Option<u64>,
}

impl CacheEntry {
    pub fn new(key: &str, value: String, ttl: Option<Duration>) -> Self {
        Self {
            key: key.to_string(),
            value,
            stored_at: Utc::now(),
            ttl_millis: ttl.map(|t| t.as_millis() as u64),
        }
    }

    pub fn age_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.stored_at).num_milliseconds()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_millis {
            // Negative age (clock skew) never counts as expired
            Some(ttl) => self.age_millis(now) > ttl as i64,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    degraded: AtomicBool,
    fallback: Mutex<HashMap<String, CacheEntry>>,
}

/// TTL-aware adapter over a [`KeyValueStore`].
///
/// Never returns an error. The first backend failure is logged and the
/// adapter switches to an in-memory map for the rest of the session, so
/// callers keep working but nothing written afterwards survives a restart.
#[derive(Clone)]
pub struct PersistentCache {
    inner: Arc<Inner>,
}

impl PersistentCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                degraded: AtomicBool::new(false),
                fallback: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// True once the backend has failed and the cache is memory-only.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    fn fallback(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.inner.fallback.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn degrade(&self, op: &str, key: &str, error: &SyncError) {
        if !self.inner.degraded.swap(true, Ordering::SeqCst) {
            warn!(op, key, error = %error, "Persistent storage unavailable, continuing in memory only");
        }
    }

    async fn load_entry(&self, key: &str) -> Option<CacheEntry> {
        if self.is_degraded() {
            return self.fallback().get(key).cloned();
        }

        match self.inner.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key, error = %e, "Discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.degrade("get", key, &e);
                self.fallback().get(key).cloned()
            }
        }
    }

    async fn store_entry(&self, entry: CacheEntry) {
        if !self.is_degraded() {
            let result = match serde_json::to_string(&entry) {
                Ok(raw) => self.inner.store.set(&entry.key, &raw).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => return,
                Err(e) => self.degrade("set", &entry.key, &e),
            }
        }
        self.fallback().insert(entry.key.clone(), entry);
    }

    /// Read a value, treating expired entries as absent.
    pub async fn get(&self, key: &str) -> Option<String> {
        let entry = self.load_entry(key).await?;
        if entry.is_expired() {
            debug!(key, "Cache entry expired");
            self.delete(key).await;
            return None;
        }
        Some(entry.value)
    }

    pub async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.store_entry(CacheEntry::new(key, value, Some(ttl))).await;
    }

    /// Write a value that never expires.
    pub async fn set_durable(&self, key: &str, value: String) {
        self.store_entry(CacheEntry::new(key, value, None)).await;
    }

    pub async fn delete(&self, key: &str) {
        if !self.is_degraded() {
            if let Err(e) = self.inner.store.delete(key).await {
                self.degrade("delete", key, &e);
            }
        }
        self.fallback().remove(key);
    }

    /// Write a fully-formed entry. Used to seed entries with a chosen
    /// `stored_at`.
    pub async fn put_entry(&self, entry: CacheEntry) {
        self.store_entry(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn cache_with_store() -> (PersistentCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (PersistentCache::new(store.clone()), store)
    }

    #[test]
    fn test_entry_expiry() {
        let mut entry = CacheEntry::new("k", "v".into(), Some(Duration::from_millis(1000)));
        assert!(!entry.is_expired());

        entry.stored_at = Utc::now() - ChronoDuration::milliseconds(1500);
        assert!(entry.is_expired());

        let durable = CacheEntry {
            stored_at: Utc::now() - ChronoDuration::days(365),
            ..CacheEntry::new("k", "v".into(), None)
        };
        assert!(!durable.is_expired());
    }

    #[test]
    fn test_entry_clock_skew_not_expired() {
        let mut entry = CacheEntry::new("k", "v".into(), Some(Duration::from_millis(10)));
        entry.stored_at = Utc::now() + ChronoDuration::minutes(5);
        assert!(!entry.is_expired());
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (cache, _) = cache_with_store();
        assert_eq!(cache.get("k").await, None);

        cache.set("k", "hello".into(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("hello"));

        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_absent_and_is_purged() {
        let (cache, store) = cache_with_store();
        let mut entry = CacheEntry::new("k", "stale".into(), Some(Duration::from_millis(1000)));
        entry.stored_at = Utc::now() - ChronoDuration::milliseconds(1500);
        cache.put_entry(entry).await;

        assert_eq!(cache.get("k").await, None);
        assert_eq!(store.raw("k"), None);
    }

    #[tokio::test]
    async fn test_ttl_elapses_in_real_time() {
        let (cache, _) = cache_with_store();
        cache.set("k", "v".into(), Duration::from_millis(1000)).await;
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_memory() {
        let (cache, store) = cache_with_store();
        store.set_failing(true);

        cache.set_durable("k", "v".into()).await;
        assert!(cache.is_degraded());
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        // Stays in memory even after the backend recovers
        store.set_failing(false);
        cache.set_durable("k2", "v2".into()).await;
        assert_eq!(store.raw("k2"), None);
        assert_eq!(cache.get("k2").await.as_deref(), Some("v2"));

        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set("k", "not json").await.unwrap();
        let cache = PersistentCache::new(store);
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.is_degraded());
    }
}
