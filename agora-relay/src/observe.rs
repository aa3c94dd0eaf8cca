//! Observability bus.
//!
//! A side channel that mirrors every lifecycle, receive, dedup and health
//! event the session sees, whether or not the room is still joined. Live
//! consumers subscribe to a broadcast stream; a bounded history ring keeps
//! the most recent records for inspection.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use agora_core::{now_millis, ContentId, MessageKind};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::transport::{ChannelEvent, HealthStatus, MessageHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObservedKind {
    Sending { handle: MessageHandle },
    Sent { handle: MessageHandle },
    PossiblyAcknowledged { handle: MessageHandle, count: u32 },
    Acknowledged { handle: MessageHandle },
    IrrecoverableError { handle: MessageHandle, error: String },
    Irretrievable { detail: String },
    Received {
        identity: ContentId,
        sender_id: String,
        message_kind: MessageKind,
    },
    Duplicate { identity: ContentId },
    DecodeFailed { error: String },
    /// Payload that arrived after its room was left; not decoded.
    Discarded { bytes: usize },
    Health { status: HealthStatus, healthy: bool },
    Joined { sender_id: String },
    Left,
}

impl ObservedKind {
    /// Normalized record for a delivery lifecycle event.
    ///
    /// `Received` is not covered here; the session records it after decode.
    pub fn from_lifecycle(event: &ChannelEvent) -> Option<Self> {
        Some(match event {
            ChannelEvent::Sending(handle) => ObservedKind::Sending { handle: handle.clone() },
            ChannelEvent::Sent(handle) => ObservedKind::Sent { handle: handle.clone() },
            ChannelEvent::PossiblyAcknowledged { handle, count } => {
                ObservedKind::PossiblyAcknowledged {
                    handle: handle.clone(),
                    count: *count,
                }
            }
            ChannelEvent::Acknowledged(handle) => ObservedKind::Acknowledged { handle: handle.clone() },
            ChannelEvent::IrrecoverableError { handle, error } => ObservedKind::IrrecoverableError {
                handle: handle.clone(),
                error: error.clone(),
            },
            ChannelEvent::Irretrievable { detail } => ObservedKind::Irretrievable {
                detail: detail.clone(),
            },
            ChannelEvent::Received { .. } => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedEvent {
    /// Wall-clock millis at emission
    pub at_ms: u64,
    /// `None` for node-level records
    pub room_id: Option<String>,
    #[serde(flatten)]
    pub kind: ObservedKind,
}

pub struct ObservabilityBus {
    tx: broadcast::Sender<ObservedEvent>,
    history: Mutex<VecDeque<ObservedEvent>>,
    history_capacity: usize,
}

impl ObservabilityBus {
    pub fn new(capacity: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<ObservedEvent>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn emit(&self, room_id: Option<&str>, kind: ObservedKind) {
        let event = ObservedEvent {
            at_ms: now_millis(),
            room_id: room_id.map(str::to_string),
            kind,
        };
        if self.history_capacity > 0 {
            let mut history = self.history();
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Live stream of records emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ObservedEvent> {
        self.tx.subscribe()
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<ObservedEvent> {
        self.history().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let bus = ObservabilityBus::new(8, 3);
        for n in 0..5 {
            bus.emit(Some("R1"), ObservedKind::Irretrievable { detail: n.to_string() });
        }
        let details: Vec<_> = bus
            .recent()
            .into_iter()
            .map(|e| match e.kind {
                ObservedKind::Irretrievable { detail } => detail,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(details, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_live() {
        let bus = ObservabilityBus::new(8, 0);
        let mut rx = bus.subscribe();
        bus.emit(None, ObservedKind::Health {
            status: HealthStatus::SufficientlyHealthy,
            healthy: true,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.room_id, None);
        assert!(matches!(event.kind, ObservedKind::Health { healthy: true, .. }));
        assert!(bus.recent().is_empty());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = ObservabilityBus::new(1, 1);
        bus.emit(Some("R1"), ObservedKind::Left);
        bus.emit(Some("R1"), ObservedKind::Left);
        assert_eq!(bus.recent().len(), 1);
    }

    #[test]
    fn test_lifecycle_normalization() {
        let h = MessageHandle::new("h");
        assert_eq!(
            ObservedKind::from_lifecycle(&ChannelEvent::PossiblyAcknowledged {
                handle: h.clone(),
                count: 3
            }),
            Some(ObservedKind::PossiblyAcknowledged { handle: h, count: 3 })
        );
        assert_eq!(
            ObservedKind::from_lifecycle(&ChannelEvent::Received { payload: vec![] }),
            None
        );
    }

    #[test]
    fn test_serialized_shape() {
        let event = ObservedEvent {
            at_ms: 5,
            room_id: Some("R1".into()),
            kind: ObservedKind::Duplicate {
                identity: ContentId::from("abc:1"),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "duplicate");
        assert_eq!(json["room_id"], "R1");
        assert_eq!(json["identity"], "abc:1");
        assert_eq!(json["at_ms"], 5);
    }
}
