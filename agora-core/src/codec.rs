//! Binary wire codec for [`Envelope`].
//!
//! Wire format (bincode, fixed-width integers, little endian):
//! ```text
//! ┌───────────────┬─────────────┬──────────────────┬────────────────┐
//! │ kind          │ timestamp   │ sender_id        │ payload        │
//! │ len:u64 + utf8│ 8 bytes     │ len:u64 + utf8   │ len:u64 + utf8 │
//! └───────────────┴─────────────┴──────────────────┴────────────────┘
//! ```
//!
//! Field order and types are fixed. Encoding is deterministic: equal
//! envelopes always produce byte-identical frames, which content identity
//! and redelivery detection rely on.

use bincode::config::{self, Config};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, UnknownKind};

/// Upper bound on a decoded frame, guards against hostile length prefixes.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

fn wire_config() -> impl Config {
    config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
        .with_limit::<MAX_FRAME_BYTES>()
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    kind: &'a str,
    timestamp: u64,
    sender_id: &'a str,
    payload: &'a str,
}

#[derive(Deserialize)]
struct WireEnvelope {
    kind: String,
    timestamp: u64,
    sender_id: String,
    payload: String,
}

/// Errors produced while turning bytes back into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] bincode::error::DecodeError),
    #[error("trailing bytes after envelope: consumed {consumed} of {len}")]
    TrailingBytes { consumed: usize, len: usize },
    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),
    #[error("payload is not valid JSON for the expected type: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Errors produced while serializing an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("envelope serialization failed: {0}")]
    Wire(#[source] bincode::error::EncodeError),
    #[error("payload serialization failed: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Serialize an envelope to its wire frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let wire = WireEnvelopeRef {
        kind: envelope.kind.as_str(),
        timestamp: envelope.timestamp,
        sender_id: &envelope.sender_id,
        payload: &envelope.payload,
    };
    bincode::serde::encode_to_vec(&wire, wire_config()).map_err(EncodeError::Wire)
}

/// Parse a wire frame.
///
/// The whole slice must be consumed; a frame followed by junk is rejected.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let (wire, consumed): (WireEnvelope, usize) =
        bincode::serde::decode_from_slice(bytes, wire_config()).map_err(DecodeError::Malformed)?;
    if consumed != bytes.len() {
        return Err(DecodeError::TrailingBytes {
            consumed,
            len: bytes.len(),
        });
    }
    Ok(Envelope {
        kind: wire.kind.parse()?,
        timestamp: wire.timestamp,
        sender_id: wire.sender_id,
        payload: wire.payload,
    })
}
