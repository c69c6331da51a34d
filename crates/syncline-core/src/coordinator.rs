//! Sync coordinator: drains the pending queue against the backend.
//!
//! The coordinator is Idle or Syncing. A pass starts from an explicit
//! `sync_now()` or from the automatic trigger that fires a short delay
//! after connectivity comes back. Only one pass runs at a time; a trigger
//! that arrives mid-pass is a no-op.
//!
//! Within a pass, actions are replayed strictly in FIFO order:
//! - success removes the action
//! - a retryable failure bumps `retry_count`, dropping the action once the
//!   budget is spent
//! - a client error drops the action immediately and notifies the user
//!
//! Afterwards the whole query cache is invalidated and a `SyncReport` is
//! published on the completion channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::api::RequestExecutor;
use crate::cache::QueryCache;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivitySource;
use crate::models::{ActionType, PendingAction, SyncOutcome, SyncReport, SyncState};
use crate::notify::{Notice, NoticeKind, Notifier};
use crate::optimistic::confirm_provisional;
use crate::queue::PendingActionQueue;
use crate::retry::{RetryDecision, RetryPolicy};

/// Buffer size for the completion broadcast channel.
const COMPLETION_BUFFER_SIZE: usize = 16;

pub struct SyncCoordinator {
    queue: PendingActionQueue,
    executor: Arc<dyn RequestExecutor>,
    cache: QueryCache,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    auto_sync_delay: Duration,
    pending_refresh_interval: Duration,
    state: watch::Sender<SyncState>,
    completions: broadcast::Sender<SyncReport>,
    syncing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Releases the mutual-exclusion flag when a pass ends, even by panic.
struct SyncGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.syncing.store(false, Ordering::SeqCst);
        self.coordinator.state.send_if_modified(|s| {
            let changed = s.is_syncing;
            s.is_syncing = false;
            changed
        });
    }
}

impl SyncCoordinator {
    pub fn new(
        queue: PendingActionQueue,
        executor: Arc<dyn RequestExecutor>,
        cache: QueryCache,
        notifier: Arc<dyn Notifier>,
        config: &SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        let (completions, _) = broadcast::channel(COMPLETION_BUFFER_SIZE);
        Self {
            queue,
            executor,
            cache,
            notifier,
            policy: RetryPolicy::default(),
            auto_sync_delay: config.auto_sync_delay(),
            pending_refresh_interval: config.pending_refresh_interval(),
            state,
            completions,
            syncing: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ===== Observable state =====

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn completions(&self) -> broadcast::Receiver<SyncReport> {
        self.completions.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending_count
    }

    pub fn queue(&self) -> &PendingActionQueue {
        &self.queue
    }

    /// Record connectivity; returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        let mut previous = online;
        self.state.send_if_modified(|s| {
            previous = s.is_online;
            s.is_online = online;
            previous != online
        });
        if previous != online {
            info!(online, "Connectivity changed");
        }
        previous
    }

    /// Recompute `pending_count` from the queue.
    pub async fn refresh_pending_count(&self) -> usize {
        let count = self.queue.len().await;
        self.state.send_if_modified(|s| {
            let changed = s.pending_count != count;
            s.pending_count = count;
            changed
        });
        count
    }

    /// Queue a mutation for the next pass.
    pub async fn enqueue(&self, action_type: ActionType, resource: &str, payload: Value) -> String {
        let id = self.queue.enqueue(action_type, resource, payload).await;
        self.refresh_pending_count().await;
        id
    }

    /// Queue an already-built action for the next pass.
    pub async fn enqueue_action(&self, action: PendingAction) -> String {
        let id = self.queue.enqueue_action(action).await;
        self.refresh_pending_count().await;
        id
    }

    // ===== Sync pass =====

    pub async fn sync_now(&self) -> SyncOutcome {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress, ignoring trigger");
            return SyncOutcome::AlreadySyncing;
        }
        let _guard = SyncGuard { coordinator: self };

        if !self.is_online() {
            debug!("Offline, skipping sync");
            return SyncOutcome::Offline;
        }

        self.state.send_modify(|s| s.is_syncing = true);
        let mut report = self.drain().await;

        let pending = self.refresh_pending_count().await;
        let finished_at = Utc::now();
        self.state.send_modify(|s| s.last_sync_at = Some(finished_at));
        self.cache.invalidate_all();

        report.pending_count = pending;
        report.finished_at = finished_at;
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            retrying = report.retrying,
            dropped = report.dropped(),
            pending,
            "Sync pass complete"
        );
        // No subscribers is fine
        let _ = self.completions.send(report.clone());
        SyncOutcome::Completed(report)
    }

    async fn drain(&self) -> SyncReport {
        let actions = self.queue.list().await;
        let mut report = SyncReport {
            attempted: actions.len(),
            ..Default::default()
        };
        if !actions.is_empty() {
            info!(count = actions.len(), "Starting sync pass");
        }

        for action in actions {
            let error = match self.executor.execute(&action).await {
                Ok(body) => {
                    self.queue.remove(&action.id).await;
                    self.settle_cache(&action, Some(&body));
                    debug!(id = %action.id, "Action confirmed");
                    report.succeeded += 1;
                    continue;
                }
                Err(error) => error,
            };

            let retry_count = if error.is_retryable() {
                match self.queue.increment_retry(&action.id).await {
                    Some(count) => count,
                    None => {
                        debug!(id = %action.id, "Action left the queue during the pass");
                        continue;
                    }
                }
            } else {
                action.retry_count
            };

            match self.policy.decide(&error, retry_count) {
                RetryDecision::RetryLater => {
                    warn!(
                        id = %action.id,
                        retry = retry_count,
                        max = self.policy.max_retries(),
                        error = %error,
                        "Action failed, will retry on next sync"
                    );
                    report.retrying += 1;
                }
                RetryDecision::Exhausted => {
                    self.queue.remove(&action.id).await;
                    self.settle_cache(&action, None);
                    error!(
                        id = %action.id,
                        resource = %action.resource,
                        retries = retry_count,
                        error = %error,
                        "Dropping action after exhausting retry budget"
                    );
                    self.notifier.notify(
                        Notice::new(
                            NoticeKind::Dropped,
                            &action.resource,
                            format!(
                                "Gave up on {} {} after {} attempts: {}",
                                action.action_type, action.resource, retry_count, error
                            ),
                        )
                        .for_action(&action.id),
                    );
                    report.exhausted += 1;
                }
                RetryDecision::Reject => {
                    self.queue.remove(&action.id).await;
                    self.settle_cache(&action, None);
                    warn!(id = %action.id, resource = %action.resource, error = %error, "Server rejected action");
                    self.notifier.notify(
                        Notice::new(
                            NoticeKind::Rejected,
                            &action.resource,
                            format!("Server rejected {} {}: {}", action.action_type, action.resource, error),
                        )
                        .for_action(&action.id),
                    );
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// Resolve the optimistic state a queued action left in the cache.
    ///
    /// On success a provisional create adopts the server entity. When the
    /// action is dropped the provisional entity is removed, and an update or
    /// delete puts back the entity it overwrote.
    fn settle_cache(&self, action: &PendingAction, response: Option<&Value>) {
        match (action.action_type, response) {
            (ActionType::Create, Some(body)) => {
                if let Some(ref temp) = action.temp_id {
                    confirm_provisional(&self.cache, &action.resource, temp, body);
                }
            }
            (ActionType::Create, None) => {
                if let Some(ref temp) = action.temp_id {
                    self.cache.remove_entity(&action.resource, temp);
                }
            }
            (ActionType::Update | ActionType::Delete, None) => {
                if let Some(ref prior) = action.prior {
                    debug!(id = %action.id, resource = %action.resource, "Restoring entity overwritten by dropped action");
                    self.cache
                        .restore_entity(&action.resource, prior.index, prior.entity.clone());
                }
            }
            (ActionType::Update | ActionType::Delete, Some(_)) => {}
        }
    }

    // ===== Lifecycle =====

    /// Subscribe to connectivity and start the periodic pending-count
    /// refresh. Calling again replaces the previous subscriptions.
    pub fn start(self: &Arc<Self>, source: &dyn ConnectivitySource) {
        self.stop();

        let mut rx = source.subscribe();
        let online = *rx.borrow_and_update();
        self.set_online(online);

        let weak = Arc::downgrade(self);
        let delay = self.auto_sync_delay;
        let listener = tokio::spawn(watch_connectivity(weak.clone(), rx, delay));

        let period = self.pending_refresh_interval;
        let ticker = tokio::spawn(refresh_pending(weak, period));

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(listener);
        tasks.push(ticker);
        info!("Sync coordinator started");
    }

    /// Detach listeners and timers. A pass already running finishes.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Sync coordinator stopped");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reconnect sync waiting out its delay. Replacing or dropping it cancels
/// the wait; a pass that already started is left alone.
#[derive(Default)]
struct PendingSync(Option<AbortHandle>);

impl PendingSync {
    fn replace(&mut self, next: Option<AbortHandle>) {
        if let Some(previous) = std::mem::replace(&mut self.0, next) {
            previous.abort();
        }
    }
}

impl Drop for PendingSync {
    fn drop(&mut self) {
        self.replace(None);
    }
}

/// Flip `is_online` on every change. An offline->online transition schedules
/// a sync after `delay`; going offline again before it fires cancels it.
async fn watch_connectivity(
    coordinator: Weak<SyncCoordinator>,
    mut rx: watch::Receiver<bool>,
    delay: Duration,
) {
    let mut pending = PendingSync::default();
    loop {
        if rx.changed().await.is_err() {
            debug!("Connectivity source closed");
            break;
        }
        let online = *rx.borrow_and_update();
        let Some(this) = coordinator.upgrade() else {
            break;
        };
        let was_online = this.set_online(online);
        drop(this);

        if !online {
            pending.replace(None);
        } else if !was_online {
            debug!(delay_ms = delay.as_millis() as u64, "Back online, scheduling sync");
            let target = coordinator.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(this) = target.upgrade() else {
                    return;
                };
                if this.is_online() {
                    // Own task, so cancelling the timer never interrupts a pass
                    tokio::spawn(async move {
                        this.sync_now().await;
                    });
                }
            });
            pending.replace(Some(timer.abort_handle()));
        }
    }
}

async fn refresh_pending(coordinator: Weak<SyncCoordinator>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(this) = coordinator.upgrade() else {
            break;
        };
        this.refresh_pending_count().await;
    }
}
