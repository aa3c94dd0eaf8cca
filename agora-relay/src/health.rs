//! Process-wide connectivity flag.
//!
//! The flag starts `false`, flips only when the transport reports a
//! different sufficiency, and goes back to `false` on shutdown. Listeners
//! hear about transitions, never about repeated reports of the same state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::listeners::{invoke_isolated, ListenerId, ListenerSet};

pub type HealthListener = Arc<dyn Fn(bool) + Send + Sync>;

struct HealthInner {
    healthy: bool,
    listeners: ListenerSet<HealthListener>,
}

pub struct HealthMonitor {
    inner: Mutex<HealthInner>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                healthy: false,
                listeners: ListenerSet::default(),
            }),
        }
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    /// Record a health report. Returns `true` if the flag changed.
    pub fn apply(&self, healthy: bool) -> bool {
        let listeners = {
            let mut inner = self.lock();
            if inner.healthy == healthy {
                return false;
            }
            inner.healthy = healthy;
            inner.listeners.snapshot()
        };
        log::info!("Connectivity changed: healthy={healthy}");
        for listener in listeners {
            invoke_isolated("health listener", || listener(healthy));
        }
        true
    }

    /// Back to `false`, notifying listeners if that is a change.
    pub fn reset(&self) -> bool {
        self.apply(false)
    }

    /// Register `listener` and invoke it at once with the current state.
    pub fn subscribe(&self, listener: HealthListener) -> ListenerId {
        let (id, current) = {
            let mut inner = self.lock();
            (inner.listeners.insert(listener.clone()), inner.healthy)
        };
        invoke_isolated("health listener", || listener(current));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(id)
    }
}
