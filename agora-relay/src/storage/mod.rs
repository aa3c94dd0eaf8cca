//! Key-value persistence for dedup history.
//!
//! ```text
//! ┌───────────────┐  mark_dirty(key)   ┌────────────┐  set()  ┌────────────────┐
//! │ receive path  │ ─────────────────► │ Persister  │ ──────► │ KeyValueStore  │
//! │ (never waits) │                    │ (batched)  │         │ memory | rocks │
//! └───────────────┘                    └────────────┘         └────────────────┘
//! ```
//!
//! Keys are `"<namespace>_<room_id>"`, values are JSON arrays of content
//! identities. Persistence is an optimization: every failure is logged and
//! swallowed, and the in-memory dedup set stays authoritative for the
//! lifetime of a room.

pub mod memory;
pub mod persist;
pub mod rocks;

pub use memory::MemoryStore;
pub use persist::{PersistStats, Persister, Snapshot};
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Minimal string key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Storage key for one room's dedup history.
pub fn storage_key(namespace: &str, room_id: &str) -> String {
    format!("{namespace}_{room_id}")
}
