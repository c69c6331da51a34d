//! Optimistic cache writes with guaranteed rollback.
//!
//! Every mutation goes through three phases:
//!
//! 1. `on_mutate` cancels in-flight reads of the affected key, snapshots
//!    the cached value, and applies the speculative write synchronously.
//! 2. `on_success` / `on_error` either swaps in the server's answer or
//!    restores the snapshot. A mutation handed to the pending queue is
//!    marked `Queued` instead and keeps its optimistic value.
//! 3. `on_settled` invalidates the key. It takes the context by value, so a
//!    mutation attempt settles exactly once.

use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{entity_id, find_entity, QueryCache, Snapshot};
use crate::error::SyncError;
use crate::models::{ActionType, PriorEntity};
use crate::notify::{Notice, NoticeKind, Notifier};

/// Marker field carried by entities that only exist locally.
pub const PROVISIONAL_FIELD: &str = "_provisional";

/// Length of the random part of a temporary id.
const TEMP_SUFFIX_LEN: usize = 6;

/// Build a temporary identity: `prefix + millis timestamp + random suffix`.
pub fn temp_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMP_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}{}-{}", prefix, Utc::now().timestamp_millis(), suffix)
}

pub fn is_provisional(entity: &Value) -> bool {
    entity
        .get(PROVISIONAL_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub(crate) fn without_provisional(entity: &Value) -> Value {
    match entity {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.remove(PROVISIONAL_FIELD);
            Value::Object(fields)
        }
        other => other.clone(),
    }
}

/// Settle a confirmed create: adopt the server entity when the response
/// carries one, otherwise keep the local entity and drop its provisional mark.
pub(crate) fn confirm_provisional(cache: &QueryCache, key: &str, temp: &str, response: &Value) {
    if entity_id(response).is_some() {
        cache.replace_entity(key, temp, without_provisional(response));
        return;
    }
    let local = cache.get(key).and_then(|data| find_entity(&data, temp));
    if let Some((_, entity)) = local {
        cache.replace_entity(key, temp, without_provisional(&entity));
    }
}

/// A mutation as the UI issues it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub action_type: ActionType,
    pub resource: String,
    pub payload: Value,
}

impl Mutation {
    pub fn create(resource: &str, payload: Value) -> Self {
        Self {
            action_type: ActionType::Create,
            resource: resource.to_string(),
            payload,
        }
    }

    /// `payload` must carry the target's `id`.
    pub fn update(resource: &str, payload: Value) -> Self {
        Self {
            action_type: ActionType::Update,
            resource: resource.to_string(),
            payload,
        }
    }

    pub fn delete(resource: &str, id: impl Into<Value>) -> Self {
        let mut payload = Map::new();
        payload.insert("id".to_string(), id.into());
        Self {
            action_type: ActionType::Delete,
            resource: resource.to_string(),
            payload: Value::Object(payload),
        }
    }

    /// The cache key the mutation touches.
    pub fn cache_key(&self) -> &str {
        &self.resource
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Optimistic value applied, no answer yet.
    Pending,
    Confirmed,
    RolledBack,
    /// Handed to the pending queue; the coordinator will settle the action.
    Queued,
}

/// Rollback context returned by `on_mutate`.
#[derive(Debug)]
pub struct MutationContext {
    mutation: Mutation,
    snapshot: Snapshot,
    temp_id: Option<String>,
    state: MutationState,
}

impl MutationContext {
    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn temp_id(&self) -> Option<&str> {
        self.temp_id.as_deref()
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    /// The entity an update or delete overwrote, taken from the snapshot.
    pub fn prior(&self) -> Option<PriorEntity> {
        if self.mutation.action_type == ActionType::Create {
            return None;
        }
        let Snapshot::Present(ref data) = self.snapshot else {
            return None;
        };
        let id = entity_id(&self.mutation.payload)?;
        find_entity(data, &id).map(|(index, entity)| PriorEntity { index, entity })
    }
}

/// What a settled mutation ended as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub key: String,
    pub outcome: MutationState,
    pub temp_id: Option<String>,
}

pub struct OptimisticUpdateManager {
    cache: QueryCache,
    notifier: Arc<dyn Notifier>,
    temp_id_prefix: String,
}

impl OptimisticUpdateManager {
    pub fn new(cache: QueryCache, notifier: Arc<dyn Notifier>, temp_id_prefix: &str) -> Self {
        Self {
            cache,
            notifier,
            temp_id_prefix: temp_id_prefix.to_string(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Phase 1: cancel reads, snapshot, write the speculative value.
    pub fn on_mutate(&self, mutation: Mutation) -> MutationContext {
        let key = mutation.cache_key().to_string();
        self.cache.cancel(&key);
        let snapshot = self.cache.snapshot(&key);
        let mut temp = None;

        match mutation.action_type {
            ActionType::Create => {
                let id = temp_id(&self.temp_id_prefix);
                let mut fields = match &mutation.payload {
                    Value::Object(fields) => fields.clone(),
                    other => {
                        let mut fields = Map::new();
                        fields.insert("value".to_string(), other.clone());
                        fields
                    }
                };
                fields.insert("id".to_string(), Value::String(id.clone()));
                fields.insert(PROVISIONAL_FIELD.to_string(), Value::Bool(true));
                self.cache.push_entity(&key, Value::Object(fields));
                temp = Some(id);
            }
            ActionType::Update => match entity_id(&mutation.payload) {
                Some(id) => {
                    self.cache.merge_entity(&key, &id, &mutation.payload);
                }
                None => warn!(resource = %key, "Update without id, no optimistic write"),
            },
            ActionType::Delete => match entity_id(&mutation.payload) {
                Some(id) => {
                    self.cache.remove_entity(&key, &id);
                }
                None => warn!(resource = %key, "Delete without id, no optimistic write"),
            },
        }

        debug!(resource = %key, kind = %mutation.action_type, temp_id = ?temp, "Applied optimistic write");
        MutationContext {
            mutation,
            snapshot,
            temp_id: temp,
            state: MutationState::Pending,
        }
    }

    /// Phase 2 (success): adopt the server's entity.
    pub fn on_success(&self, ctx: &mut MutationContext, response: &Value) {
        if ctx.state != MutationState::Pending {
            warn!(state = ?ctx.state, "Ignoring success for a mutation that already resolved");
            return;
        }
        let key = ctx.mutation.cache_key();
        let server_id = entity_id(response);

        match (ctx.mutation.action_type, &ctx.temp_id) {
            (ActionType::Create, Some(temp)) => {
                confirm_provisional(&self.cache, key, temp, response);
            }
            (ActionType::Update, _) => {
                if let (Some(server_id), Some(target)) = (server_id, entity_id(&ctx.mutation.payload)) {
                    if server_id == target {
                        self.cache.replace_entity(key, &target, response.clone());
                    }
                }
            }
            _ => {}
        }
        ctx.state = MutationState::Confirmed;
    }

    /// Phase 2 (failure): put the cache back exactly as it was.
    pub fn on_error(&self, ctx: &mut MutationContext, error: &SyncError) {
        if ctx.state != MutationState::Pending && ctx.state != MutationState::Queued {
            warn!(state = ?ctx.state, "Ignoring error for a mutation that already resolved");
            return;
        }
        let key = ctx.mutation.cache_key().to_string();
        match ctx.temp_id {
            // Other writes may have landed on the collection since; only
            // the provisional entity is ours to take back.
            Some(ref temp) => {
                self.cache.remove_entity(&key, temp);
            }
            None => self.cache.restore(&key, ctx.snapshot.clone()),
        }

        self.notifier.notify(Notice::new(
            NoticeKind::RolledBack,
            &key,
            format!("Could not {} {}: {}", ctx.mutation.action_type, key, error),
        ));
        ctx.state = MutationState::RolledBack;
    }

    /// The mutation was handed to the pending queue.
    pub fn mark_queued(&self, ctx: &mut MutationContext) {
        if ctx.state == MutationState::Pending {
            ctx.state = MutationState::Queued;
        }
    }

    /// Phase 3: invalidate, whatever happened.
    pub fn on_settled(&self, ctx: MutationContext) -> Settled {
        let key = ctx.mutation.cache_key().to_string();
        if ctx.state == MutationState::Pending {
            debug!(resource = %key, "Settling a mutation that never resolved");
        }
        self.cache.invalidate(&key);
        Settled {
            key,
            outcome: ctx.state,
            temp_id: ctx.temp_id,
        }
    }
}
