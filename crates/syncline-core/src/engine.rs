//! Session facade wiring the queue, caches, coordinator and optimistic
//! manager together.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::RequestExecutor;
use crate::cache::{KeyValueStore, PersistentCache, QueryCache};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivitySource;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::models::{ActionType, PendingAction, SyncOutcome, SyncReport, SyncState};
use crate::notify::Notifier;
use crate::optimistic::{Mutation, MutationState, OptimisticUpdateManager, Settled};
use crate::queue::PendingActionQueue;

/// Storage key for the persisted query cache (JSON object of key -> value).
pub const SNAPSHOT_KEY: &str = "syncline:query-cache";

/// How a `mutate` call ended.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub settled: Settled,
    /// Id of the pending action, when the mutation was queued.
    pub action_id: Option<String>,
    /// Server response, when the mutation was confirmed online.
    pub response: Option<Value>,
    /// Failure that caused a rollback or queueing.
    pub error: Option<SyncError>,
}

impl MutationOutcome {
    pub fn state(&self) -> MutationState {
        self.settled.outcome
    }
}

pub struct OfflineEngine {
    config: SyncConfig,
    storage: PersistentCache,
    queries: QueryCache,
    executor: Arc<dyn RequestExecutor>,
    optimistic: OptimisticUpdateManager,
    coordinator: Arc<SyncCoordinator>,
}

impl OfflineEngine {
    /// Restore the queue and the cache snapshot from `store`.
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn RequestExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let storage = PersistentCache::new(store);
        let queue = PendingActionQueue::restore(storage.clone()).await;

        let queries = QueryCache::new();
        if let Some(raw) = storage.get(SNAPSHOT_KEY).await {
            match serde_json::from_str::<HashMap<String, Value>>(&raw) {
                Ok(snapshot) => {
                    debug!(keys = snapshot.len(), "Hydrating query cache");
                    queries.hydrate(snapshot);
                }
                Err(e) => warn!(error = %e, "Query cache snapshot is unreadable, ignoring"),
            }
        }

        let optimistic = OptimisticUpdateManager::new(
            queries.clone(),
            notifier.clone(),
            &config.temp_id_prefix,
        );
        let coordinator = Arc::new(SyncCoordinator::new(
            queue,
            executor.clone(),
            queries.clone(),
            notifier,
            &config,
        ));
        coordinator.refresh_pending_count().await;

        Self {
            config,
            storage,
            queries,
            executor,
            optimistic,
            coordinator,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// True once the durable store has failed and the session runs from memory.
    pub fn is_degraded(&self) -> bool {
        self.storage.is_degraded()
    }

    // ===== Queue =====

    pub async fn enqueue(&self, action_type: ActionType, resource: &str, payload: Value) -> String {
        self.coordinator.enqueue(action_type, resource, payload).await
    }

    pub async fn pending(&self) -> Vec<PendingAction> {
        self.coordinator.queue().list().await
    }

    pub fn pending_count(&self) -> usize {
        self.coordinator.pending_count()
    }

    // ===== Mutations =====

    /// Apply `mutation` optimistically, then confirm it online or queue it.
    ///
    /// Online, the request is attempted immediately: success adopts the
    /// server entity, a client error rolls back, and a retryable failure
    /// hands the action to the queue with the optimistic value kept.
    /// Offline, the action is queued straight away.
    ///
    /// While older actions for the same resource are still queued, the
    /// mutation joins the queue behind them and a pass is triggered, so the
    /// server sees the edits in the order they were made.
    pub async fn mutate(&self, mutation: Mutation) -> MutationOutcome {
        let mut ctx = self.optimistic.on_mutate(mutation);
        let mut action = PendingAction::new(
            ctx.mutation().action_type,
            &ctx.mutation().resource,
            ctx.mutation().payload.clone(),
        );
        if let Some(temp) = ctx.temp_id() {
            action = action.with_temp_id(temp.to_string());
        }
        if let Some(prior) = ctx.prior() {
            action = action.with_prior(prior);
        }

        let mut action_id = None;
        let mut response = None;
        let mut error = None;
        let mut drain_after = false;

        if action.action_type != ActionType::Create && action.target_id().is_none() {
            let invalid = SyncError::InvalidAction(format!(
                "{} on {} has no target id",
                action.action_type, action.resource
            ));
            self.optimistic.on_error(&mut ctx, &invalid);
            error = Some(invalid);
        } else if !self.coordinator.is_online() {
            debug!(resource = %action.resource, "Offline, queueing mutation");
            action_id = Some(self.coordinator.enqueue_action(action).await);
            self.optimistic.mark_queued(&mut ctx);
        } else if self.coordinator.queue().has_pending_for(&action.resource).await {
            debug!(resource = %action.resource, "Earlier actions still queued, queueing behind them");
            action_id = Some(self.coordinator.enqueue_action(action).await);
            self.optimistic.mark_queued(&mut ctx);
            drain_after = true;
        } else {
            match self.executor.execute(&action).await {
                Ok(body) => {
                    self.optimistic.on_success(&mut ctx, &body);
                    response = Some(body);
                }
                Err(e) if e.is_retryable() => {
                    warn!(resource = %action.resource, error = %e, "Mutation failed online, queueing");
                    action_id = Some(self.coordinator.enqueue_action(action).await);
                    self.optimistic.mark_queued(&mut ctx);
                    error = Some(e);
                }
                Err(e) => {
                    self.optimistic.on_error(&mut ctx, &e);
                    error = Some(e);
                }
            }
        }

        let outcome = MutationOutcome {
            settled: self.optimistic.on_settled(ctx),
            action_id,
            response,
            error,
        };
        if drain_after {
            self.coordinator.sync_now().await;
        }
        outcome
    }

    // ===== Sync and reads =====

    pub async fn sync_now(&self) -> SyncOutcome {
        self.coordinator.sync_now().await
    }

    /// Refetch `resource` into the query cache. Returns whether the result
    /// was stored; a superseded or failed fetch leaves the cache as it was.
    pub async fn refresh(&self, resource: &str) -> bool {
        let executor = self.executor.clone();
        let target = resource.to_string();
        let handle = self
            .queries
            .fetch(resource, async move { executor.fetch(&target).await });
        match handle.await {
            Ok(written) => written,
            Err(e) if e.is_cancelled() => {
                debug!(resource, "Refresh superseded");
                false
            }
            Err(e) => {
                warn!(resource, error = %e, "Refresh task failed");
                false
            }
        }
    }

    /// Record connectivity without a `ConnectivitySource`.
    pub fn set_online(&self, online: bool) {
        self.coordinator.set_online(online);
    }

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.coordinator.state()
    }

    pub fn current_state(&self) -> SyncState {
        self.coordinator.current_state()
    }

    pub fn completions(&self) -> broadcast::Receiver<SyncReport> {
        self.coordinator.completions()
    }

    // ===== Lifecycle =====

    /// Write the query cache so the next session starts warm.
    pub async fn persist_snapshot(&self) {
        let snapshot = self.queries.export();
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                self.storage
                    .set(SNAPSHOT_KEY, raw, self.config.snapshot_ttl())
                    .await;
                debug!(keys = snapshot.len(), "Persisted query cache snapshot");
            }
            Err(e) => warn!(error = %e, "Failed to serialize query cache snapshot"),
        }
    }

    pub fn start(&self, connectivity: &dyn ConnectivitySource) {
        self.coordinator.start(connectivity);
    }

    pub async fn stop(&self) {
        self.coordinator.stop();
        self.persist_snapshot().await;
        info!(pending = self.pending_count(), "Offline engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::notify::LogNotifier;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticExecutor;

    #[async_trait]
    impl RequestExecutor for StaticExecutor {
        async fn execute(&self, _action: &PendingAction) -> Result<Value, SyncError> {
            Ok(json!({"id": 1}))
        }

        async fn fetch(&self, _resource: &str) -> Result<Value, SyncError> {
            Ok(json!([{"id": 1}]))
        }
    }

    async fn engine(store: Arc<MemoryStore>) -> OfflineEngine {
        OfflineEngine::open(
            SyncConfig::default(),
            store,
            Arc::new(StaticExecutor),
            Arc::new(LogNotifier),
        )
        .await
    }

    #[tokio::test]
    async fn test_snapshot_round_trips_as_stale() {
        let store = Arc::new(MemoryStore::new());
        let first = engine(store.clone()).await;
        first.queries().set("todos", json!([{"id": 7}]));
        first.stop().await;

        let second = engine(store).await;
        assert_eq!(second.queries().get("todos").unwrap(), json!([{"id": 7}]));
        assert!(second.queries().is_stale("todos"));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let cache = PersistentCache::new(store.clone());
        cache.set_durable(SNAPSHOT_KEY, "{not json".to_string()).await;

        let engine = engine(store).await;
        assert!(engine.queries().keys().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_writes_fresh_entry() {
        let engine = engine(Arc::new(MemoryStore::new())).await;
        assert!(engine.refresh("todos").await);
        assert_eq!(engine.queries().get("todos").unwrap(), json!([{"id": 1}]));
        assert!(!engine.queries().is_stale("todos"));
    }

    #[tokio::test]
    async fn test_offline_update_carries_prior_entity() {
        let engine = engine(Arc::new(MemoryStore::new())).await;
        engine.queries().set("todos", json!([{"id": 1, "title": "a"}]));

        let outcome = engine.mutate(Mutation::update("todos", json!({"id": 1, "title": "b"}))).await;
        assert_eq!(outcome.state(), MutationState::Queued);

        let queued = engine.pending().await;
        let prior = queued[0].prior.as_ref().unwrap();
        assert_eq!(prior.index, 0);
        assert_eq!(prior.entity, json!({"id": 1, "title": "a"}));
    }

    #[tokio::test]
    async fn test_update_without_id_rolls_back_immediately() {
        let engine = engine(Arc::new(MemoryStore::new())).await;
        let outcome = engine.mutate(Mutation::update("todos", json!({"title": "x"}))).await;
        assert_eq!(outcome.state(), MutationState::RolledBack);
        assert!(matches!(outcome.error, Some(SyncError::InvalidAction(_))));
        assert_eq!(engine.pending_count(), 0);
    }
}
