use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::entity_id;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    /// HTTP verb used to replay this action against the backend.
    pub fn method(&self) -> &'static str {
        match self {
            ActionType::Create => "POST",
            ActionType::Update => "PUT",
            ActionType::Delete => "DELETE",
        }
    }
}

impl FromStr for ActionType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(ActionType::Create),
            "update" => Ok(ActionType::Update),
            "delete" => Ok(ActionType::Delete),
            _ => Err(SyncError::InvalidAction(format!("unknown action type '{}'", s))),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
        }
    }
}

/// The cached entity an update or delete overwrote, and where it sat in
/// its collection. Put back if the server never accepts the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PriorEntity {
    pub index: usize,
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub entity: Value,
}

/// A mutation recorded locally and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PendingAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub resource: String,
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Provisional identity of the optimistic entity a queued create produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<PriorEntity>,
}

impl PendingAction {
    pub fn new(action_type: ActionType, resource: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_type,
            resource: resource.to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            temp_id: None,
            prior: None,
        }
    }

    pub fn with_temp_id(mut self, temp_id: String) -> Self {
        self.temp_id = Some(temp_id);
        self
    }

    pub fn with_prior(mut self, prior: PriorEntity) -> Self {
        self.prior = Some(prior);
        self
    }

    /// Identity of the entity an update or delete targets.
    pub fn target_id(&self) -> Option<String> {
        match self.action_type {
            ActionType::Create => None,
            ActionType::Update | ActionType::Delete => entity_id(&self.payload),
        }
    }
}
