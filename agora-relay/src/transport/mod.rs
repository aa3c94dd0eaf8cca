//! Transport seam.
//!
//! The relay sits on top of a pub/sub engine that already delivers every
//! send to all live subscribers at least once, possibly duplicated and out
//! of order. This module describes the surface the relay consumes from that
//! engine:
//!
//! ```text
//! Transport ──create_node──► TransportNode ──create_channel(room)──► ChannelBinding
//!                               │   │                                 ├── channel.send(bytes) → handle
//!                               │   └── encoder/decoder (one topic)   └── events: queue of ChannelEvent
//!                               └── health stream
//! ```
//!
//! Room isolation is the channel's job. Every room shares the node's single
//! content topic.

pub mod loopback;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub use loopback::{LoopbackConfig, LoopbackNetwork};

/// Opaque, locally-unique handle the transport returns for each send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh random handle.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node health as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unhealthy,
    MinimallyHealthy,
    SufficientlyHealthy,
}

impl HealthStatus {
    /// Only `SufficientlyHealthy` counts as connected.
    pub fn is_sufficient(&self) -> bool {
        matches!(self, HealthStatus::SufficientlyHealthy)
    }
}

/// Node construction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeConfig {
    /// Connect to the default bootstrap peers.
    pub bootstrap: bool,
}

/// Outbound half of the shared topic binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEncoder {
    pub content_topic: String,
}

impl TopicEncoder {
    pub fn new(content_topic: impl Into<String>) -> Self {
        Self {
            content_topic: content_topic.into(),
        }
    }
}

/// Inbound half of the shared topic binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDecoder {
    pub content_topic: String,
}

impl TopicDecoder {
    pub fn new(content_topic: impl Into<String>) -> Self {
        Self {
            content_topic: content_topic.into(),
        }
    }
}

/// Lifecycle and delivery events emitted by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `sending-message`
    Sending(MessageHandle),
    /// `message-sent`
    Sent(MessageHandle),
    /// `message-possibly-acknowledged`
    PossiblyAcknowledged { handle: MessageHandle, count: u32 },
    /// `message-acknowledged`
    Acknowledged(MessageHandle),
    /// `sending-message-irrecoverable-error`
    IrrecoverableError { handle: MessageHandle, error: String },
    /// `irretrievable-message`
    Irretrievable { detail: String },
    /// `message-received`
    Received { payload: Vec<u8> },
}

impl ChannelEvent {
    /// Transport-level event name.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Sending(_) => "sending-message",
            ChannelEvent::Sent(_) => "message-sent",
            ChannelEvent::PossiblyAcknowledged { .. } => "message-possibly-acknowledged",
            ChannelEvent::Acknowledged(_) => "message-acknowledged",
            ChannelEvent::IrrecoverableError { .. } => "sending-message-irrecoverable-error",
            ChannelEvent::Irretrievable { .. } => "irretrievable-message",
            ChannelEvent::Received { .. } => "message-received",
        }
    }

    /// The send handle this event refers to, if any.
    pub fn handle(&self) -> Option<&MessageHandle> {
        match self {
            ChannelEvent::Sending(handle)
            | ChannelEvent::Sent(handle)
            | ChannelEvent::Acknowledged(handle)
            | ChannelEvent::PossiblyAcknowledged { handle, .. }
            | ChannelEvent::IrrecoverableError { handle, .. } => Some(handle),
            ChannelEvent::Irretrievable { .. } | ChannelEvent::Received { .. } => None,
        }
    }
}

/// Ordered queue of events for one channel.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("node failed to start: {0}")]
    NodeStart(String),
    #[error("channel creation failed for room {room_id}: {reason}")]
    ChannelCreation { room_id: String, reason: String },
    #[error("send rejected: {0}")]
    SendRejected(String),
    #[error("node is stopped")]
    Stopped,
}

/// Factory for the shared node.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn create_node(&self, config: NodeConfig) -> Result<Arc<dyn TransportNode>, TransportError>;
}

/// A running transport node.
#[async_trait]
pub trait TransportNode: Send + Sync {
    fn create_encoder(&self, content_topic: &str) -> TopicEncoder {
        TopicEncoder::new(content_topic)
    }

    fn create_decoder(&self, content_topic: &str) -> TopicDecoder {
        TopicDecoder::new(content_topic)
    }

    /// Subscribe to health transitions reported after this call.
    fn subscribe_health(&self) -> broadcast::Receiver<HealthStatus>;

    /// Health at the time of the call.
    fn current_health(&self) -> HealthStatus;

    /// Bind a channel for one room on the shared topic.
    async fn create_channel(
        &self,
        room_id: &str,
        sender_id: &str,
        encoder: &TopicEncoder,
        decoder: &TopicDecoder,
    ) -> Result<ChannelBinding, TransportError>;

    async fn stop(&self);
}

/// One room's channel plus its event queue.
///
/// Dropping the channel releases the room's subscription; the event queue
/// closes once the transport has flushed what was already in flight.
pub struct ChannelBinding {
    pub channel: Box<dyn TransportChannel>,
    pub events: ChannelEvents,
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Hand an opaque payload to the transport.
    async fn send(&self, payload: Vec<u8>) -> Result<MessageHandle, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_random_unique() {
        assert_ne!(MessageHandle::random(), MessageHandle::random());
    }

    #[test]
    fn test_event_handle_extraction() {
        let h = MessageHandle::new("h1");
        assert_eq!(ChannelEvent::Sent(h.clone()).handle(), Some(&h));
        assert_eq!(
            ChannelEvent::PossiblyAcknowledged { handle: h.clone(), count: 2 }.handle(),
            Some(&h)
        );
        assert_eq!(ChannelEvent::Received { payload: vec![] }.handle(), None);
        assert_eq!(ChannelEvent::Irretrievable { detail: "x".into() }.handle(), None);
    }

    #[test]
    fn test_event_names() {
        let h = MessageHandle::new("h");
        assert_eq!(ChannelEvent::Sending(h.clone()).name(), "sending-message");
        assert_eq!(
            ChannelEvent::IrrecoverableError { handle: h, error: "e".into() }.name(),
            "sending-message-irrecoverable-error"
        );
    }

    #[test]
    fn test_health_sufficiency() {
        assert!(HealthStatus::SufficientlyHealthy.is_sufficient());
        assert!(!HealthStatus::MinimallyHealthy.is_sufficient());
        assert!(!HealthStatus::Unhealthy.is_sufficient());
    }
}
