//! syncline - offline-first sync engine.
//!
//! Mutations made while disconnected are recorded in a durable FIFO queue
//! and replayed against the backend once connectivity returns. The UI sees
//! every change immediately through optimistic cache writes, which are
//! confirmed or rolled back when the server answers.
//!
//! Most hosts only need [`OfflineEngine`]; the pieces it wires together are
//! public for hosts that want a different arrangement.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod models;
pub mod notify;
pub mod optimistic;
pub mod queue;
pub mod retry;

pub use api::{RequestExecutor, RestClient};
pub use cache::{FileStore, KeyValueStore, MemoryStore, PersistentCache, QueryCache, Snapshot};
pub use config::SyncConfig;
pub use connectivity::{ConnectivitySource, HttpHealthCheck, ManualConnectivity};
pub use coordinator::SyncCoordinator;
pub use engine::{MutationOutcome, OfflineEngine};
pub use error::{FailureKind, SyncError};
pub use models::{ActionType, PendingAction, PriorEntity, SyncOutcome, SyncReport, SyncState};
pub use notify::{ChannelNotifier, LogNotifier, Notice, NoticeKind, Notifier};
pub use optimistic::{Mutation, MutationState, OptimisticUpdateManager};
pub use queue::PendingActionQueue;
pub use retry::{RetryDecision, RetryPolicy};
