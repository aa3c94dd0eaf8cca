//! Application envelope and the domain message kinds it carries.
//!
//! Every message exchanged in a room is an [`Envelope`]:
//! ```text
//! ┌──────────┬─────────────┬───────────┬──────────────────┐
//! │ kind     │ timestamp   │ sender_id │ payload          │
//! │ string   │ u64 (ms)    │ string    │ string (JSON)    │
//! └──────────┴─────────────┴───────────┴──────────────────┘
//! ```
//!
//! The payload is opaque to the relay. Helpers are provided for the common
//! case of a JSON-serialized application value.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, EncodeError};
use crate::identity::{identity_of, ContentId};

/// How long a message's content identity is remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Identity is written to persistent storage so a reload does not replay
    /// the message. Used for kinds that create content.
    Persisted,
    /// Identity is deduplicated in memory for the lifetime of the room only.
    /// Used for idempotent state transitions that are cheap to re-apply.
    MemoryOnly,
}

/// Domain message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Liveness probe.
    Ping,
    /// A new question was asked.
    Question,
    /// A new answer to a question.
    Answer,
    /// A vote on a question.
    Upvote,
    /// A moderator hid or restored a question.
    Moderation,
    /// The room owner opened or closed the room.
    Activation,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Ping,
        MessageKind::Question,
        MessageKind::Answer,
        MessageKind::Upvote,
        MessageKind::Moderation,
        MessageKind::Activation,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::Question => "QUESTION",
            MessageKind::Answer => "ANSWER",
            MessageKind::Upvote => "UPVOTE",
            MessageKind::Moderation => "MODERATION",
            MessageKind::Activation => "ACTIVATION",
        }
    }

    /// Dedup retention for this kind.
    ///
    /// Content-creating kinds must survive a reload; state transitions
    /// carry their full effect ("set active = true") and may be re-applied.
    pub fn retention(&self) -> RetentionPolicy {
        match self {
            MessageKind::Question | MessageKind::Answer | MessageKind::Upvote => {
                RetentionPolicy::Persisted
            }
            MessageKind::Ping | MessageKind::Moderation | MessageKind::Activation => {
                RetentionPolicy::MemoryOnly
            }
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a wire kind name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message kind: {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A single application message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch, stamped by the sender.
    pub timestamp: u64,
    pub sender_id: String,
    /// Application-defined JSON.
    pub payload: String,
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        timestamp: u64,
        sender_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            timestamp,
            sender_id: sender_id.into(),
            payload: payload.into(),
        }
    }

    /// Create an envelope stamped with the current wall-clock time.
    pub fn now(kind: MessageKind, sender_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(kind, now_millis(), sender_id, payload)
    }

    /// Create an envelope whose payload is `value` serialized as JSON.
    pub fn json<T: Serialize>(
        kind: MessageKind,
        timestamp: u64,
        sender_id: impl Into<String>,
        value: &T,
    ) -> Result<Self, EncodeError> {
        let payload = serde_json::to_string(value).map_err(EncodeError::Payload)?;
        Ok(Self::new(kind, timestamp, sender_id, payload))
    }

    /// Parse the payload as a JSON application value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_str(&self.payload).map_err(DecodeError::Payload)
    }

    /// Content identity of this envelope.
    pub fn identity(&self) -> ContentId {
        identity_of(self.kind.as_str(), self.timestamp, &self.sender_id, &self.payload)
    }

    /// Dedup retention, derived from the kind.
    pub fn retention(&self) -> RetentionPolicy {
        self.kind.retention()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
