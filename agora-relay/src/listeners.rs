//! Listener registries.
//!
//! Listeners are snapshotted out of their registry and invoked after every
//! lock is released, so a listener may freely call back into the session.
//! A panicking listener is logged and skipped; the next one still runs.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

/// Token returned on registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

/// Insertion-ordered set of listeners.
pub(crate) struct ListenerSet<F: Clone> {
    entries: Vec<(ListenerId, F)>,
    next_id: u64,
}

impl<F: Clone> Default for ListenerSet<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<F: Clone> ListenerSet<F> {
    pub fn insert(&mut self, listener: F) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<F> {
        self.entries.iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Run `f`, containing any panic it raises.
///
/// Returns `false` if `f` panicked.
pub(crate) fn invoke_isolated(context: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("{context} panicked: {reason}");
            false
        }
    }
}
