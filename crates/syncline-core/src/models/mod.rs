//! Data models for the sync engine.
//!
//! - `PendingAction`, `ActionType`: queued mutations awaiting confirmation
//! - `SyncState`, `SyncReport`: observable coordinator state and pass results

pub mod action;
pub mod state;

pub use action::{ActionType, PendingAction, PriorEntity};
pub use state::{SyncOutcome, SyncReport, SyncState};
