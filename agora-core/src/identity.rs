//! Content-addressed message identity.
//!
//! The identity of a message is a pure function of its four semantic fields,
//! so a redelivered or resent copy maps to the same identity no matter which
//! transport-level id it travelled under.
//!
//! Construction:
//! ```text
//! FNV-1a/128( len(kind) ‖ kind ‖ timestamp ‖ len(sender) ‖ sender ‖ len(payload) ‖ payload )
//!   → "<32 hex digits>:<timestamp>"
//! ```
//!
//! Each variable-length field is length-prefixed so that no two distinct
//! field tuples share a preimage. The raw timestamp is appended to the hash
//! so two distinct messages colliding in the hash must also share their
//! send time.

use std::fmt;

use serde::{Deserialize, Serialize};

const FNV128_OFFSET: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
const FNV128_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

/// Stable identity of an envelope's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ContentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

struct Fnv128(u128);

impl Fnv128 {
    fn new() -> Self {
        Self(FNV128_OFFSET)
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u128;
            self.0 = self.0.wrapping_mul(FNV128_PRIME);
        }
    }

    fn write_field(&mut self, field: &str) {
        self.write(&(field.len() as u64).to_le_bytes());
        self.write(field.as_bytes());
    }

    fn finish(&self) -> u128 {
        self.0
    }
}

/// Compute the content identity of a message from its fields.
pub fn identity_of(kind: &str, timestamp: u64, sender_id: &str, payload: &str) -> ContentId {
    let mut hasher = Fnv128::new();
    hasher.write_field(kind);
    hasher.write(&timestamp.to_le_bytes());
    hasher.write_field(sender_id);
    hasher.write_field(payload);
    ContentId(format!("{:032x}:{timestamp}", hasher.finish()))
}
