//! Local caching for offline data access.
//!
//! Two layers live here:
//! - `PersistentCache`: TTL-aware adapter over a pluggable `KeyValueStore`
//!   that survives restarts and degrades to memory if storage fails
//! - `QueryCache`: the in-memory view the UI renders from, with fetch
//!   cancellation and invalidation events

pub mod manager;
pub mod query;
pub mod store;

pub use manager::{CacheEntry, PersistentCache};
pub use query::{entity_id, find_entity, CacheEvent, QueryCache, QueryEntry, Snapshot};
pub use store::{FileStore, KeyValueStore, MemoryStore};
