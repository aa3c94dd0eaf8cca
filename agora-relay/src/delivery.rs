//! Send-handle → callback registry for one room.
//!
//! ```text
//!   register(h) ─► Pending ─sending─► Sending ─sent─► Sent ─possibly-ack─► PossiblyAcknowledged(n)
//!                     │                                │                        │   ▲ (0..n)
//!                     │                                └─────────acknowledged───┴───┴──► removed
//!                     └────────────irrecoverable-error (any state)────────────────────► removed
//! ```
//!
//! `observe` only updates the map and returns what should be fired; the
//! caller fires it once the room lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::SendError;
use crate::listeners::invoke_isolated;
use crate::transport::{ChannelEvent, MessageHandle};

type HandleCallback = Box<dyn Fn(&MessageHandle) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&MessageHandle, &SendError) + Send + Sync>;

/// Optional per-send callbacks. Each fires at most once.
#[derive(Default)]
pub struct DeliveryCallbacks {
    on_sending: Option<HandleCallback>,
    on_sent: Option<HandleCallback>,
    on_acknowledged: Option<HandleCallback>,
    on_error: Option<ErrorCallback>,
}

impl DeliveryCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sending(mut self, f: impl Fn(&MessageHandle) + Send + Sync + 'static) -> Self {
        self.on_sending = Some(Box::new(f));
        self
    }

    pub fn on_sent(mut self, f: impl Fn(&MessageHandle) + Send + Sync + 'static) -> Self {
        self.on_sent = Some(Box::new(f));
        self
    }

    pub fn on_acknowledged(mut self, f: impl Fn(&MessageHandle) + Send + Sync + 'static) -> Self {
        self.on_acknowledged = Some(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&MessageHandle, &SendError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_sending.is_none()
            && self.on_sent.is_none()
            && self.on_acknowledged.is_none()
            && self.on_error.is_none()
    }
}

impl fmt::Debug for DeliveryCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryCallbacks")
            .field("on_sending", &self.on_sending.is_some())
            .field("on_sent", &self.on_sent.is_some())
            .field("on_acknowledged", &self.on_acknowledged.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Progress of a pending send. Terminal states are never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sending,
    Sent,
    PossiblyAcknowledged { count: u32 },
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sending => 1,
            DeliveryState::Sent => 2,
            DeliveryState::PossiblyAcknowledged { .. } => 3,
        }
    }
}

struct PendingSend {
    callbacks: Arc<DeliveryCallbacks>,
    state: DeliveryState,
}

enum NoticeKind {
    Sending,
    Sent,
    Acknowledged,
    Failed(SendError),
}

/// A callback invocation owed to the application.
pub struct DeliveryNotice {
    handle: MessageHandle,
    callbacks: Arc<DeliveryCallbacks>,
    kind: NoticeKind,
}

impl DeliveryNotice {
    pub fn handle(&self) -> &MessageHandle {
        &self.handle
    }

    /// Invoke the matching callback, containing any panic.
    pub fn fire(self) {
        let handle = &self.handle;
        let cbs = &self.callbacks;
        match &self.kind {
            NoticeKind::Sending => {
                if let Some(f) = &cbs.on_sending {
                    invoke_isolated("on_sending callback", || f(handle));
                }
            }
            NoticeKind::Sent => {
                if let Some(f) = &cbs.on_sent {
                    invoke_isolated("on_sent callback", || f(handle));
                }
            }
            NoticeKind::Acknowledged => {
                if let Some(f) = &cbs.on_acknowledged {
                    invoke_isolated("on_acknowledged callback", || f(handle));
                }
            }
            NoticeKind::Failed(err) => {
                if let Some(f) = &cbs.on_error {
                    invoke_isolated("on_error callback", || f(handle, err));
                }
            }
        }
    }
}

#[derive(Default)]
pub struct DeliveryTracker {
    pending: HashMap<MessageHandle, PendingSend>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `callbacks` to `handle`, replacing any earlier registration.
    pub fn register(&mut self, handle: MessageHandle, callbacks: DeliveryCallbacks) {
        let previous = self.pending.insert(
            handle,
            PendingSend {
                callbacks: Arc::new(callbacks),
                state: DeliveryState::Pending,
            },
        );
        if previous.is_some() {
            log::debug!("Replaced callbacks for a re-registered handle");
        }
    }

    /// Apply a channel event. Events for unknown handles are ignored.
    ///
    /// Repeated or late progress events are absorbed: the state only moves
    /// forward and `Sending`/`Sent` notices are produced on the transition.
    pub fn observe(&mut self, event: &ChannelEvent) -> Option<DeliveryNotice> {
        let (handle, kind) = match event {
            ChannelEvent::Sending(handle) => {
                if !self.advance(handle, DeliveryState::Sending) {
                    return None;
                }
                (handle, NoticeKind::Sending)
            }
            ChannelEvent::Sent(handle) => {
                if !self.advance(handle, DeliveryState::Sent) {
                    return None;
                }
                (handle, NoticeKind::Sent)
            }
            ChannelEvent::PossiblyAcknowledged { handle, count } => {
                self.advance(handle, DeliveryState::PossiblyAcknowledged { count: *count });
                return None;
            }
            ChannelEvent::Acknowledged(handle) => (handle, NoticeKind::Acknowledged),
            ChannelEvent::IrrecoverableError { handle, error } => (
                handle,
                NoticeKind::Failed(SendError::Irrecoverable {
                    reason: error.clone(),
                }),
            ),
            ChannelEvent::Irretrievable { .. } | ChannelEvent::Received { .. } => return None,
        };

        let callbacks = match kind {
            NoticeKind::Acknowledged | NoticeKind::Failed(_) => self.pending.remove(handle)?.callbacks,
            NoticeKind::Sending | NoticeKind::Sent => self.pending.get(handle)?.callbacks.clone(),
        };
        Some(DeliveryNotice {
            handle: handle.clone(),
            callbacks,
            kind,
        })
    }

    /// Move `handle` to `state` if that is progress. A higher
    /// possibly-acknowledged count also counts as progress.
    fn advance(&mut self, handle: &MessageHandle, state: DeliveryState) -> bool {
        let Some(entry) = self.pending.get_mut(handle) else {
            return false;
        };
        let forward = match (entry.state, state) {
            (
                DeliveryState::PossiblyAcknowledged { count: old },
                DeliveryState::PossiblyAcknowledged { count: new },
            ) => new > old,
            (old, new) => new.rank() > old.rank(),
        };
        if forward {
            entry.state = state;
        }
        forward
    }

    pub fn state(&self, handle: &MessageHandle) -> Option<DeliveryState> {
        self.pending.get(handle).map(|p| p.state)
    }

    pub fn contains(&self, handle: &MessageHandle) -> bool {
        self.pending.contains_key(handle)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, tag: &str) -> DeliveryCallbacks {
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let (ta, tb, tc, td) = (tag.to_string(), tag.to_string(), tag.to_string(), tag.to_string());
        DeliveryCallbacks::new()
            .on_sending(move |_| a.lock().unwrap().push(format!("{ta}:sending")))
            .on_sent(move |_| b.lock().unwrap().push(format!("{tb}:sent")))
            .on_acknowledged(move |_| c.lock().unwrap().push(format!("{tc}:ack")))
            .on_error(move |_, e| d.lock().unwrap().push(format!("{td}:error:{e}")))
    }

    fn feed(tracker: &mut DeliveryTracker, event: ChannelEvent) {
        if let Some(notice) = tracker.observe(&event) {
            notice.fire();
        }
    }

    #[test]
    fn test_happy_path_removes_on_ack() {
        let log: Log = Arc::default();
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("h");
        tracker.register(h.clone(), recording(&log, "h"));

        feed(&mut tracker, ChannelEvent::Sending(h.clone()));
        assert_eq!(tracker.state(&h), Some(DeliveryState::Sending));
        feed(&mut tracker, ChannelEvent::Sent(h.clone()));
        feed(&mut tracker, ChannelEvent::PossiblyAcknowledged { handle: h.clone(), count: 1 });
        feed(&mut tracker, ChannelEvent::PossiblyAcknowledged { handle: h.clone(), count: 2 });
        assert!(tracker.contains(&h));
        assert_eq!(
            tracker.state(&h),
            Some(DeliveryState::PossiblyAcknowledged { count: 2 })
        );

        feed(&mut tracker, ChannelEvent::Acknowledged(h.clone()));
        assert!(!tracker.contains(&h));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["h:sending", "h:sent", "h:ack"]);

        feed(&mut tracker, ChannelEvent::Acknowledged(h));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_irrecoverable_error_isolated_to_handle() {
        let log: Log = Arc::default();
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("h");
        let h2 = MessageHandle::new("h2");
        tracker.register(h.clone(), recording(&log, "h"));
        tracker.register(h2.clone(), recording(&log, "h2"));

        feed(
            &mut tracker,
            ChannelEvent::IrrecoverableError { handle: h.clone(), error: "no peers".into() },
        );
        assert!(!tracker.contains(&h));
        assert!(tracker.contains(&h2));

        feed(&mut tracker, ChannelEvent::Acknowledged(h2.clone()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["h:error:irrecoverable delivery failure: no peers", "h2:ack"]
        );
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_reregister_overwrites() {
        let log: Log = Arc::default();
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("h");
        tracker.register(h.clone(), recording(&log, "first"));
        tracker.register(h.clone(), recording(&log, "second"));
        assert_eq!(tracker.pending_count(), 1);

        feed(&mut tracker, ChannelEvent::Acknowledged(h));
        assert_eq!(*log.lock().unwrap(), vec!["second:ack"]);
    }

    #[test]
    fn test_unknown_handle_ignored() {
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("stranger");
        assert!(tracker.observe(&ChannelEvent::Sent(h.clone())).is_none());
        assert!(tracker.observe(&ChannelEvent::Acknowledged(h)).is_none());
        assert!(tracker
            .observe(&ChannelEvent::Received { payload: vec![1] })
            .is_none());
    }

    #[test]
    fn test_empty_callbacks_still_tracked() {
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("h");
        tracker.register(h.clone(), DeliveryCallbacks::new());
        assert!(DeliveryCallbacks::new().is_empty());

        let notice = tracker.observe(&ChannelEvent::Acknowledged(h.clone())).unwrap();
        assert_eq!(notice.handle(), &h);
        notice.fire();
        assert!(!tracker.contains(&h));
    }

    #[test]
    fn test_panicking_callback_contained() {
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("h");
        tracker.register(h.clone(), DeliveryCallbacks::new().on_sent(|_| panic!("boom")));
        feed(&mut tracker, ChannelEvent::Sent(h.clone()));
        assert!(tracker.contains(&h));
    }

    #[test]
    fn test_repeated_and_late_progress_fire_once() {
        let log: Log = Arc::default();
        let mut tracker = DeliveryTracker::new();
        let h = MessageHandle::new("h");
        tracker.register(h.clone(), recording(&log, "h"));

        feed(&mut tracker, ChannelEvent::Sent(h.clone()));
        feed(&mut tracker, ChannelEvent::Sent(h.clone()));
        feed(&mut tracker, ChannelEvent::PossiblyAcknowledged { handle: h.clone(), count: 2 });
        feed(&mut tracker, ChannelEvent::PossiblyAcknowledged { handle: h.clone(), count: 1 });
        feed(&mut tracker, ChannelEvent::Sending(h.clone()));
        assert_eq!(
            tracker.state(&h),
            Some(DeliveryState::PossiblyAcknowledged { count: 2 })
        );

        feed(&mut tracker, ChannelEvent::Acknowledged(h.clone()));
        feed(&mut tracker, ChannelEvent::Sent(h));
        assert_eq!(*log.lock().unwrap(), vec!["h:sent", "h:ack"]);
    }
}
