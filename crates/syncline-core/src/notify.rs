//! Sink for user-visible failure notifications.

use tokio::sync::mpsc;
use tracing::{error, warn};

/// Buffer size for the notification channel.
pub const NOTICE_BUFFER_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// The server rejected a mutation; it will not be retried.
    Rejected,
    /// A mutation ran out of retries and was dropped.
    Dropped,
    /// An optimistic change was rolled back.
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub resource: String,
    pub action_id: Option<String>,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, resource: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.to_string(),
            action_id: None,
            message: message.into(),
        }
    }

    pub fn for_action(mut self, action_id: &str) -> Self {
        self.action_id = Some(action_id.to_string());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        error!(
            kind = ?notice.kind,
            resource = %notice.resource,
            action_id = notice.action_id.as_deref().unwrap_or("-"),
            "{}",
            notice.message
        );
    }
}

/// Forwards notices to a receiver owned by the UI.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::Receiver<Notice>) {
        let (tx, rx) = mpsc::channel(NOTICE_BUFFER_SIZE);
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        if let Err(e) = self.tx.try_send(notice) {
            warn!(error = %e, "Failed to deliver notice - channel full or closed");
        }
    }
}
