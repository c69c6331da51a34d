//! Key-value drivers backing the persistent cache.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SyncError;

/// Opaque async key-value persistence driver.
///
/// Implementations report failures; the [`PersistentCache`](super::PersistentCache)
/// adapter is responsible for turning them into degraded, in-memory operation.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;
    async fn delete(&self, key: &str) -> Result<(), SyncError>;
}

// ============================================================================
// File store
// ============================================================================

/// Stores each key as a JSON file inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Map a key onto a file name. Anything outside `[A-Za-z0-9_-]` is
    /// percent-escaped so distinct keys never share a file.
    fn key_path(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 5);
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                name.push(b as char);
            } else {
                name.push_str(&format!("%{:02X}", b));
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        match tokio::fs::read_to_string(self.key_path(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.key_path(key);
        // Write-then-rename so a crash never leaves a half-written file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// Process-local store. Can be flipped into a failing mode to simulate a
/// disabled or full backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Storage("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw contents for a key, bypassing the failure switch.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.check()?;
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.check()?;
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        self.check()?;
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        assert_eq!(store.get("syncline:queue").await.unwrap(), None);
        store.set("syncline:queue", "[1,2]").await.unwrap();
        assert_eq!(store.get("syncline:queue").await.unwrap().as_deref(), Some("[1,2]"));

        store.delete("syncline:queue").await.unwrap();
        assert_eq!(store.get("syncline:queue").await.unwrap(), None);
        // Deleting a missing key is fine
        store.delete("syncline:queue").await.unwrap();
    }

    #[test]
    fn test_file_store_key_paths_are_distinct() {
        let store = FileStore::new(PathBuf::from("/data"));
        let a = store.key_path("a:b");
        let b = store.key_path("a_b");
        assert_ne!(a, b);
        assert_eq!(a, PathBuf::from("/data/a%3Ab.json"));
        assert_eq!(store.key_path("../etc"), PathBuf::from("/data/%2E%2E%2Fetc.json"));
    }

    #[tokio::test]
    async fn test_memory_store_failing_mode() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();

        store.set_failing(true);
        assert!(matches!(store.get("k").await, Err(SyncError::Storage(_))));
        assert!(store.set("k", "w").await.is_err());
        assert_eq!(store.raw("k").as_deref(), Some("v"));

        store.set_failing(false);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
