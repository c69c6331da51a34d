//! Durable FIFO queue of mutations awaiting server confirmation.
//!
//! The full queue is written through the persistent cache after every
//! mutating call, so it survives a restart. The in-memory list and its
//! persisted image change under one lock; a single action's insert,
//! update, or removal is never observable half-done.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::PersistentCache;
use crate::models::{ActionType, PendingAction};

/// Storage key for the serialized queue (JSON array of `PendingAction`).
pub const QUEUE_KEY: &str = "syncline:pending-actions";

#[derive(Clone)]
pub struct PendingActionQueue {
    actions: Arc<Mutex<Vec<PendingAction>>>,
    cache: PersistentCache,
}

impl PendingActionQueue {
    /// Empty queue writing through `cache`. Does not read existing state.
    pub fn new(cache: PersistentCache) -> Self {
        Self {
            actions: Arc::new(Mutex::new(Vec::new())),
            cache,
        }
    }

    /// Rebuild the queue from its persisted image.
    pub async fn restore(cache: PersistentCache) -> Self {
        let mut actions = match cache.get(QUEUE_KEY).await {
            Some(raw) => match serde_json::from_str::<Vec<PendingAction>>(&raw) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!(error = %e, "Persisted queue is unreadable, starting empty");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        // Stable, so equal timestamps keep their persisted order
        actions.sort_by_key(|a| a.enqueued_at);
        if !actions.is_empty() {
            info!(count = actions.len(), "Restored pending actions");
        }
        Self {
            actions: Arc::new(Mutex::new(actions)),
            cache,
        }
    }

    async fn persist(&self, actions: &[PendingAction]) {
        match serde_json::to_string(actions) {
            Ok(raw) => self.cache.set_durable(QUEUE_KEY, raw).await,
            Err(e) => error!(error = %e, "Failed to serialize pending actions"),
        }
    }

    /// Record a new mutation and return its id.
    pub async fn enqueue(&self, action_type: ActionType, resource: &str, payload: Value) -> String {
        self.enqueue_action(PendingAction::new(action_type, resource, payload))
            .await
    }

    /// Queue an already-built action, keeping the list ordered by `enqueued_at`.
    pub async fn enqueue_action(&self, action: PendingAction) -> String {
        let id = action.id.clone();
        let mut actions = self.actions.lock().await;
        let pos = actions.partition_point(|a| a.enqueued_at <= action.enqueued_at);
        debug!(id = %id, kind = %action.action_type, resource = %action.resource, "Enqueued action");
        actions.insert(pos, action);
        self.persist(&actions).await;
        id
    }

    /// Ordered snapshot of the queue.
    pub async fn list(&self) -> Vec<PendingAction> {
        self.actions.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<PendingAction> {
        self.actions.lock().await.iter().find(|a| a.id == id).cloned()
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut actions = self.actions.lock().await;
        let before = actions.len();
        actions.retain(|a| a.id != id);
        if actions.len() == before {
            return false;
        }
        self.persist(&actions).await;
        true
    }

    /// Bump the retry counter and return the new value.
    pub async fn increment_retry(&self, id: &str) -> Option<u32> {
        let mut actions = self.actions.lock().await;
        let action = actions.iter_mut().find(|a| a.id == id)?;
        action.retry_count += 1;
        let count = action.retry_count;
        self.persist(&actions).await;
        Some(count)
    }

    /// Whether any queued action targets `resource`.
    pub async fn has_pending_for(&self, resource: &str) -> bool {
        self.actions.lock().await.iter().any(|a| a.resource == resource)
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        let mut actions = self.actions.lock().await;
        actions.clear();
        self.persist(&actions).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KeyValueStore, MemoryStore};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn new_queue() -> (PendingActionQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = PendingActionQueue::new(PersistentCache::new(store.clone()));
        (queue, store)
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order() {
        let (queue, _) = new_queue();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(queue.enqueue(ActionType::Create, "todos", json!({"n": i})).await);
        }

        let listed: Vec<String> = queue.list().await.into_iter().map(|a| a.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(queue.len().await, 10);
    }

    #[tokio::test]
    async fn test_every_mutation_is_persisted() {
        let (queue, store) = new_queue();
        let id = queue.enqueue(ActionType::Update, "todos", json!({"id": 1})).await;
        assert!(store.raw(QUEUE_KEY).unwrap().contains(&id));

        assert_eq!(queue.increment_retry(&id).await, Some(1));
        let restored = PendingActionQueue::restore(PersistentCache::new(store.clone())).await;
        assert_eq!(restored.get(&id).await.unwrap().retry_count, 1);

        assert!(queue.remove(&id).await);
        let restored = PendingActionQueue::restore(PersistentCache::new(store.clone())).await;
        assert!(restored.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let (queue, _) = new_queue();
        assert!(!queue.remove("nope").await);
        assert_eq!(queue.increment_retry("nope").await, None);
    }

    #[tokio::test]
    async fn test_enqueue_action_inserts_by_timestamp() {
        let (queue, _) = new_queue();
        let later = queue.enqueue(ActionType::Create, "todos", json!({})).await;

        let mut earlier = PendingAction::new(ActionType::Delete, "todos", json!({"id": 1}));
        earlier.enqueued_at = Utc::now() - Duration::seconds(10);
        let earlier_id = queue.enqueue_action(earlier).await;

        let listed: Vec<String> = queue.list().await.into_iter().map(|a| a.id).collect();
        assert_eq!(listed, vec![earlier_id, later]);
    }

    #[tokio::test]
    async fn test_restore_sorts_and_tolerates_garbage() {
        let store = Arc::new(MemoryStore::new());
        let cache = PersistentCache::new(store.clone());

        let mut a = PendingAction::new(ActionType::Create, "todos", json!({}));
        let b = PendingAction::new(ActionType::Create, "todos", json!({}));
        a.enqueued_at = b.enqueued_at + Duration::seconds(5);
        cache
            .set_durable(QUEUE_KEY, serde_json::to_string(&vec![a.clone(), b.clone()]).unwrap())
            .await;

        let queue = PendingActionQueue::restore(cache.clone()).await;
        let listed: Vec<String> = queue.list().await.into_iter().map(|x| x.id).collect();
        assert_eq!(listed, vec![b.id, a.id]);

        cache.set_durable(QUEUE_KEY, "{broken".to_string()).await;
        let queue = PendingActionQueue::restore(cache).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_queue_keeps_working_when_storage_fails() {
        let (queue, store) = new_queue();
        store.set_failing(true);

        let id = queue.enqueue(ActionType::Create, "todos", json!({})).await;
        assert_eq!(queue.len().await, 1);
        assert!(queue.remove(&id).await);
        assert!(store.get(QUEUE_KEY).await.is_err());
    }

    #[tokio::test]
    async fn test_has_pending_for() {
        let (queue, _) = new_queue();
        queue.enqueue(ActionType::Update, "todos", json!({"id": 1})).await;
        assert!(queue.has_pending_for("todos").await);
        assert!(!queue.has_pending_for("notes").await);
    }

    #[tokio::test]
    async fn test_clear() {
        let (queue, _) = new_queue();
        queue.enqueue(ActionType::Create, "todos", json!({})).await;
        queue.clear().await;
        assert!(queue.is_empty().await);
    }
}
