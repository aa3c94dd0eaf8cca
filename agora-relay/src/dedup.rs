//! Per-room bounded set of seen content identities.
//!
//! ```text
//!   oldest                                   newest
//!   ┌──────┬──────┬──────┬─── … ───┬──────┬──────┐
//!   │ id_0 │ id_1 │ id_2 │         │ id_n │ new  │  ← insert
//!   └──────┴──────┴──────┴─── … ───┴──────┴──────┘
//!      ▲ evicted first once len > capacity
//! ```
//!
//! Each entry remembers its [`RetentionPolicy`]. Only `Persisted` entries
//! are written to storage; `MemoryOnly` entries still take part in
//! deduplication and eviction for as long as the room is joined.

use std::sync::{Mutex, PoisonError};

use agora_core::{ContentId, RetentionPolicy};
use indexmap::IndexMap;

use crate::storage::{KeyValueStore, Snapshot};

/// Default number of identities remembered per room.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

pub struct DedupStore {
    key: String,
    capacity: usize,
    entries: IndexMap<ContentId, RetentionPolicy>,
}

impl DedupStore {
    /// Empty store persisted under `key`.
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self {
            key: key.into(),
            capacity: capacity.max(1),
            entries: IndexMap::new(),
        }
    }

    /// Load the persisted history for `key`.
    ///
    /// Any read or parse failure yields an empty store; the failure is
    /// logged, not returned.
    pub fn load(store: &dyn KeyValueStore, key: impl Into<String>, capacity: usize) -> Self {
        let mut dedup = Self::new(key, capacity);
        let raw = match store.get(&dedup.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return dedup,
            Err(e) => {
                log::warn!("Could not read dedup history {}: {e}", dedup.key);
                return dedup;
            }
        };
        match serde_json::from_str::<Vec<ContentId>>(&raw) {
            Ok(ids) => {
                for id in ids {
                    dedup.entries.insert(id, RetentionPolicy::Persisted);
                }
                dedup.evict();
                log::debug!("Loaded {} dedup entries for {}", dedup.len(), dedup.key);
            }
            Err(e) => {
                log::warn!("Discarding corrupt dedup history {}: {e}", dedup.key);
            }
        }
        dedup
    }

    pub fn has(&self, id: &ContentId) -> bool {
        self.entries.contains_key(id)
    }

    /// Record `id`. Returns `true` if it was not already present.
    ///
    /// Re-inserting a known identity changes neither membership nor order.
    pub fn insert(&mut self, id: ContentId, retention: RetentionPolicy) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, retention);
        self.evict();
        true
    }

    fn evict(&mut self) {
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
    }

    /// Identities with `Persisted` retention, oldest first.
    pub fn persisted_ids(&self) -> impl Iterator<Item = &ContentId> {
        self.entries
            .iter()
            .filter(|(_, r)| **r == RetentionPolicy::Persisted)
            .map(|(id, _)| id)
    }

    /// Serialized form of the persisted identities.
    pub fn snapshot(&self) -> String {
        let ids: Vec<&ContentId> = self.persisted_ids().collect();
        // A Vec of plain strings always serializes.
        serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string())
    }

    /// Write the persisted identities straight to `store`, swallowing errors.
    pub fn persist(&self, store: &dyn KeyValueStore) {
        if let Err(e) = store.set(&self.key, &self.snapshot()) {
            log::warn!("Could not persist dedup history {}: {e}", self.key);
        }
    }

    /// All identities, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ContentId> {
        self.entries.keys()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A room's store as shared with the persister, which renders it at commit.
impl Snapshot for Mutex<DedupStore> {
    fn snapshot(&self) -> String {
        self.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }
}
