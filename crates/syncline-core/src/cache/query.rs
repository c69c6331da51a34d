//! In-memory query cache read by the UI layer.
//!
//! Entries are keyed by opaque strings (by convention the resource name,
//! holding a JSON array of entities). Fetches are tracked per key so an
//! optimistic write can cancel a slow read before it lands.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::error::SyncError;

/// Buffer size for the cache event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Value captured before a speculative write.
///
/// `Absent` is distinct from `Present(Value::Null)`: a key that did not
/// exist is removed on restore, while a cached `null` is written back.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Present(Value),
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Updated(String),
    Removed(String),
    Invalidated(String),
    InvalidatedAll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    pub data: Value,
    pub updated_at: DateTime<Utc>,
    pub stale: bool,
}

impl QueryEntry {
    fn fresh(data: Value) -> Self {
        Self {
            data,
            updated_at: Utc::now(),
            stale: false,
        }
    }
}

struct InFlight {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, QueryEntry>,
    in_flight: HashMap<String, InFlight>,
    next_generation: u64,
}

/// Extract an entity's identity as a string (`"id"` may be a string or a number).
pub fn entity_id(entity: &Value) -> Option<String> {
    match entity.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Locate the entity with identity `id` in a cached value: its position in a
/// collection (0 for a single entity) and a copy of it.
pub fn find_entity(data: &Value, id: &str) -> Option<(usize, Value)> {
    match data {
        Value::Array(items) => items
            .iter()
            .position(|e| has_id(e, id))
            .map(|pos| (pos, items[pos].clone())),
        single if has_id(single, id) => Some((0, single.clone())),
        _ => None,
    }
}

fn has_id(entity: &Value, id: &str) -> bool {
    entity_id(entity).as_deref() == Some(id)
}

#[derive(Clone)]
pub struct QueryCache {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // ===== Reads =====

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().entries.get(key).map(|e| e.data.clone())
    }

    pub fn entry(&self, key: &str) -> Option<QueryEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Missing keys count as stale.
    pub fn is_stale(&self, key: &str) -> bool {
        self.lock().entries.get(key).map(|e| e.stale).unwrap_or(true)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self, key: &str) -> Snapshot {
        match self.lock().entries.get(key) {
            Some(entry) => Snapshot::Present(entry.data.clone()),
            None => Snapshot::Absent,
        }
    }

    // ===== Writes =====

    pub fn set(&self, key: &str, data: Value) {
        self.lock()
            .entries
            .insert(key.to_string(), QueryEntry::fresh(data));
        self.emit(CacheEvent::Updated(key.to_string()));
    }

    pub fn remove(&self, key: &str) {
        if self.lock().entries.remove(key).is_some() {
            self.emit(CacheEvent::Removed(key.to_string()));
        }
    }

    pub fn restore(&self, key: &str, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Present(data) => self.set(key, data),
            Snapshot::Absent => self.remove(key),
        }
    }

    /// Apply `f` to the cached value in place and report whether it changed.
    fn modify(&self, key: &str, f: impl FnOnce(&mut Value) -> bool) -> bool {
        let changed = {
            let mut state = self.lock();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    let changed = f(&mut entry.data);
                    if changed {
                        entry.updated_at = Utc::now();
                    }
                    changed
                }
                None => false,
            }
        };
        if changed {
            self.emit(CacheEvent::Updated(key.to_string()));
        }
        changed
    }

    /// Append an entity to the collection under `key`, creating it if absent.
    pub fn push_entity(&self, key: &str, entity: Value) {
        {
            let mut state = self.lock();
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| QueryEntry::fresh(Value::Array(Vec::new())));
            match entry.data {
                Value::Array(ref mut items) => items.push(entity),
                ref mut other => *other = Value::Array(vec![entity]),
            }
            entry.updated_at = Utc::now();
        }
        self.emit(CacheEvent::Updated(key.to_string()));
    }

    /// Swap the entity with identity `id` for `entity`. Works on a
    /// collection or on a single cached entity.
    pub fn replace_entity(&self, key: &str, id: &str, entity: Value) -> bool {
        self.modify(key, |data| match data {
            Value::Array(items) => match items.iter_mut().find(|e| has_id(e, id)) {
                Some(slot) => {
                    *slot = entity;
                    true
                }
                None => false,
            },
            single if has_id(single, id) => {
                *single = entity;
                true
            }
            _ => false,
        })
    }

    /// Shallow-merge the fields of `patch` into the entity with identity `id`.
    pub fn merge_entity(&self, key: &str, id: &str, patch: &Value) -> bool {
        let Some(fields) = patch.as_object() else {
            return false;
        };
        let apply = |target: &mut Value| {
            if let Some(obj) = target.as_object_mut() {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
            }
        };
        self.modify(key, |data| match data {
            Value::Array(items) => match items.iter_mut().find(|e| has_id(e, id)) {
                Some(slot) => {
                    apply(slot);
                    true
                }
                None => false,
            },
            single if has_id(single, id) => {
                apply(single);
                true
            }
            _ => false,
        })
    }

    /// Remove the entity with identity `id` from the collection under `key`.
    pub fn remove_entity(&self, key: &str, id: &str) -> bool {
        let is_single = self
            .lock()
            .entries
            .get(key)
            .map(|e| has_id(&e.data, id))
            .unwrap_or(false);
        if is_single {
            self.remove(key);
            return true;
        }
        self.modify(key, |data| match data {
            Value::Array(items) => {
                let before = items.len();
                items.retain(|e| !has_id(e, id));
                items.len() != before
            }
            _ => false,
        })
    }

    /// Put `entity` back at `index` of the collection under `key`. An entity
    /// with the same identity still present is overwritten in place; a
    /// single-entity key is simply rewritten.
    pub fn restore_entity(&self, key: &str, index: usize, entity: Value) {
        let id = entity_id(&entity);
        {
            let mut state = self.lock();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    match entry.data {
                        Value::Array(ref mut items) => {
                            let existing = id
                                .as_deref()
                                .and_then(|id| items.iter().position(|e| has_id(e, id)));
                            match existing {
                                Some(pos) => items[pos] = entity,
                                None => {
                                    let at = index.min(items.len());
                                    items.insert(at, entity);
                                }
                            }
                        }
                        ref mut single => *single = entity,
                    }
                    entry.updated_at = Utc::now();
                }
                None => {
                    state.entries.insert(key.to_string(), QueryEntry::fresh(entity));
                }
            }
        }
        self.emit(CacheEvent::Updated(key.to_string()));
    }

    // ===== Invalidation =====

    pub fn invalidate(&self, key: &str) {
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.stale = true;
        }
        self.emit(CacheEvent::Invalidated(key.to_string()));
    }

    pub fn invalidate_all(&self) {
        for entry in self.lock().entries.values_mut() {
            entry.stale = true;
        }
        self.emit(CacheEvent::InvalidatedAll);
    }

    // ===== Fetch tracking =====

    /// Run `fetcher` in the background and store its result under `key`.
    ///
    /// A newer fetch for the same key supersedes (aborts) the older one.
    /// The join handle resolves to `true` if the result was written.
    pub fn fetch<F>(&self, key: &str, fetcher: F) -> JoinHandle<bool>
    where
        F: Future<Output = Result<Value, SyncError>> + Send + 'static,
    {
        let key = key.to_string();
        let cache = self.clone();

        // Lock held across spawn so the task cannot finish before it is registered
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = fetcher.await;
            cache.complete_fetch(&task_key, generation, result)
        });

        if let Some(previous) = state.in_flight.insert(
            key,
            InFlight {
                generation,
                handle: task.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
        task
    }

    fn complete_fetch(&self, key: &str, generation: u64, result: Result<Value, SyncError>) -> bool {
        let written = {
            let mut state = self.lock();
            let current = state
                .in_flight
                .get(key)
                .map(|f| f.generation == generation)
                .unwrap_or(false);
            if !current {
                debug!(key, "Discarding result of cancelled fetch");
                return false;
            }
            state.in_flight.remove(key);
            match result {
                Ok(data) => {
                    state.entries.insert(key.to_string(), QueryEntry::fresh(data));
                    true
                }
                Err(e) => {
                    debug!(key, error = %e, "Fetch failed, keeping cached data");
                    false
                }
            }
        };
        if written {
            self.emit(CacheEvent::Updated(key.to_string()));
        }
        written
    }

    /// Abort the in-flight fetch for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().in_flight.remove(key) {
            Some(flight) => {
                flight.handle.abort();
                debug!(key, "Cancelled in-flight fetch");
                true
            }
            None => false,
        }
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.lock().in_flight.contains_key(key)
    }

    // ===== Snapshot persistence =====

    pub fn export(&self) -> HashMap<String, Value> {
        self.lock()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.data.clone()))
            .collect()
    }

    /// Load persisted data. Entries are marked stale so the next read refetches.
    pub fn hydrate(&self, data: HashMap<String, Value>) {
        let mut state = self.lock();
        for (key, value) in data {
            state.entries.entry(key).or_insert(QueryEntry {
                data: value,
                updated_at: Utc::now(),
                stale: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[test]
    fn test_restore_entity_reinserts_at_position() {
        let cache = QueryCache::new();
        cache.set("todos", json!([{"id": 1}, {"id": 3}]));
        cache.restore_entity("todos", 1, json!({"id": 2}));
        assert_eq!(cache.get("todos").unwrap(), json!([{"id": 1}, {"id": 2}, {"id": 3}]));

        cache.restore_entity("todos", 0, json!({"id": 3, "title": "old"}));
        assert_eq!(cache.get("todos").unwrap()[2], json!({"id": 3, "title": "old"}));

        cache.restore_entity("todos", 99, json!({"id": 4}));
        assert_eq!(cache.get("todos").unwrap().as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_restore_entity_on_missing_single_key() {
        let cache = QueryCache::new();
        cache.restore_entity("todo/5", 0, json!({"id": 5}));
        assert_eq!(cache.get("todo/5").unwrap(), json!({"id": 5}));
    }

    #[test]
    fn test_entity_id() {
        assert_eq!(entity_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(entity_id(&json!({"id": "temp-1"})), Some("temp-1".to_string()));
        assert_eq!(entity_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_snapshot_distinguishes_absent_from_null() {
        let cache = QueryCache::new();
        assert_eq!(cache.snapshot("k"), Snapshot::Absent);

        cache.set("k", Value::Null);
        assert_eq!(cache.snapshot("k"), Snapshot::Present(Value::Null));

        cache.restore("k", Snapshot::Absent);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_entity_helpers() {
        let cache = QueryCache::new();
        cache.set("todos", json!([{"id": 1, "title": "a"}, {"id": 2, "title": "b"}]));

        assert!(cache.merge_entity("todos", "1", &json!({"title": "z", "done": true})));
        assert!(cache.remove_entity("todos", "2"));
        cache.push_entity("todos", json!({"id": "temp-9"}));
        assert!(cache.replace_entity("todos", "temp-9", json!({"id": 9})));
        assert!(!cache.remove_entity("todos", "missing"));

        assert_eq!(
            cache.get("todos"),
            Some(json!([{"id": 1, "title": "z", "done": true}, {"id": 9}]))
        );
    }

    #[test]
    fn test_push_entity_creates_collection() {
        let cache = QueryCache::new();
        cache.push_entity("notes", json!({"id": "a"}));
        assert_eq!(cache.get("notes"), Some(json!([{"id": "a"}])));
    }

    #[test]
    fn test_single_entity_key() {
        let cache = QueryCache::new();
        cache.set("todo/7", json!({"id": 7, "title": "x"}));
        assert!(cache.merge_entity("todo/7", "7", &json!({"title": "y"})));
        assert_eq!(cache.get("todo/7"), Some(json!({"id": 7, "title": "y"})));
        assert!(cache.remove_entity("todo/7", "7"));
        assert_eq!(cache.get("todo/7"), None);
    }

    #[test]
    fn test_invalidation_marks_stale_and_emits() {
        let cache = QueryCache::new();
        let mut events = cache.subscribe();
        cache.set("a", json!(1));
        cache.set("b", json!(2));
        assert!(!cache.is_stale("a"));

        cache.invalidate("a");
        assert!(cache.is_stale("a"));
        assert!(!cache.is_stale("b"));

        cache.invalidate_all();
        assert!(cache.is_stale("b"));
        assert!(cache.is_stale("never-cached"));

        assert_eq!(events.try_recv().unwrap(), CacheEvent::Updated("a".into()));
        assert_eq!(events.try_recv().unwrap(), CacheEvent::Updated("b".into()));
        assert_eq!(events.try_recv().unwrap(), CacheEvent::Invalidated("a".into()));
        assert_eq!(events.try_recv().unwrap(), CacheEvent::InvalidatedAll);
    }

    #[test]
    fn test_hydrate_marks_stale_without_clobbering() {
        let cache = QueryCache::new();
        cache.set("live", json!("new"));
        let mut data = HashMap::new();
        data.insert("live".to_string(), json!("old"));
        data.insert("persisted".to_string(), json!([1, 2]));
        cache.hydrate(data);

        assert_eq!(cache.get("live"), Some(json!("new")));
        assert_eq!(cache.get("persisted"), Some(json!([1, 2])));
        assert!(cache.is_stale("persisted"));
        assert_eq!(cache.export().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_writes_result() {
        let cache = QueryCache::new();
        let handle = cache.fetch("todos", async { Ok(json!([{"id": 1}])) });
        assert!(handle.await.unwrap());
        assert_eq!(cache.get("todos"), Some(json!([{"id": 1}])));
        assert!(!cache.is_fetching("todos"));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_data() {
        let cache = QueryCache::new();
        cache.set("todos", json!([]));
        let handle = cache.fetch("todos", async { Err(SyncError::Network("down".into())) });
        assert!(!handle.await.unwrap());
        assert_eq!(cache.get("todos"), Some(json!([])));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_never_lands() {
        let cache = QueryCache::new();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = cache.fetch("todos", async move {
            let _ = rx.await;
            Ok(json!(["stale server data"]))
        });
        assert!(cache.is_fetching("todos"));

        assert!(cache.cancel("todos"));
        cache.set("todos", json!(["optimistic"]));
        let _ = tx.send(());

        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(cache.get("todos"), Some(json!(["optimistic"])));
        assert!(!cache.cancel("todos"));
    }

    #[tokio::test]
    async fn test_newer_fetch_supersedes_older() {
        let cache = QueryCache::new();
        let (_tx, rx) = oneshot::channel::<()>();
        let first = cache.fetch("k", async move {
            let _ = rx.await;
            Ok(json!("first"))
        });
        let second = cache.fetch("k", async { Ok(json!("second")) });

        assert!(second.await.unwrap());
        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(cache.get("k"), Some(json!("second")));
    }
}
