use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observable coordinator state consumed by the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: usize,
}

impl SyncState {
    /// Short status line for display
    pub fn status_message(&self) -> String {
        if self.is_syncing {
            "Syncing changes...".to_string()
        } else if !self.is_online {
            match self.pending_count {
                0 => "Offline".to_string(),
                n => format!("Offline - {} pending changes", n),
            }
        } else if self.pending_count > 0 {
            format!("{} changes waiting to sync", self.pending_count)
        } else {
            "Up to date".to_string()
        }
    }
}

/// Summary of one completed sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Retryable failures still queued for a later pass.
    pub retrying: usize,
    /// Actions removed after a client error.
    pub rejected: usize,
    /// Actions removed after exhausting the retry budget.
    pub exhausted: usize,
    pub pending_count: usize,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn dropped(&self) -> usize {
        self.rejected + self.exhausted
    }
}

/// Result of asking the coordinator to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass is in flight; this trigger did nothing.
    AlreadySyncing,
    /// Not online; the queue was not touched.
    Offline,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
