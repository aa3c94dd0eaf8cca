use agora_core::EncodeError;
use thiserror::Error;

use crate::transport::TransportError;

/// Failure of one send, delivered to that send's callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The transport refused the payload at call time.
    #[error("transport rejected the send: {0}")]
    Rejected(#[from] TransportError),
    /// The transport gave up on the message after accepting it.
    #[error("irrecoverable delivery failure: {reason}")]
    Irrecoverable { reason: String },
}

/// Errors surfaced by [`crate::RelaySession`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// The transport node could not be started. Not retried.
    #[error("initialization failed: {0}")]
    Initialization(#[source] TransportError),
    #[error("could not bind channel: {0}")]
    ChannelCreation(#[source] TransportError),
    /// The room has not been joined (or has been left).
    #[error("room {0} is not joined")]
    NotJoined(String),
    #[error("could not encode envelope: {0}")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl RelayError {
    pub fn is_not_joined(&self) -> bool {
        matches!(self, RelayError::NotJoined(_))
    }
}
