//! Retry budget and backoff rules.

use std::time::Duration;

use crate::error::{FailureKind, SyncError};

/// Attempts an action gets across sync passes before it is dropped.
pub const MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for in-request retries.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Upper bound for a single backoff delay.
const MAX_BACKOFF_MS: u64 = 30_000;

/// What to do with a queued action after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave it queued for the next pass.
    RetryLater,
    /// Budget spent; remove it for good.
    Exhausted,
    /// The server rejected it; remove it without retrying.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Classify first so client errors never touch the retry budget.
    pub fn classify(&self, error: &SyncError) -> FailureKind {
        error.kind()
    }

    /// Decide the fate of an action whose retry count is now `retry_count`
    /// (already incremented for retryable failures).
    pub fn decide(&self, error: &SyncError, retry_count: u32) -> RetryDecision {
        match self.classify(error) {
            FailureKind::Terminal => RetryDecision::Reject,
            FailureKind::Retryable if retry_count >= self.max_retries => RetryDecision::Exhausted,
            FailureKind::Retryable => RetryDecision::RetryLater,
        }
    }

    /// Delay before in-request attempt number `attempt` (0-based):
    /// `min(1000 * 2^attempt, 30000)` milliseconds.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(INITIAL_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }
}
