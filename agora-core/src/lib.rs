//! # agora-core: message model for Agora rooms
//!
//! Pure, I/O-free building blocks shared by the relay and its callers.
//!
//! ```text
//!   Envelope ──encode──► bytes ──(transport)──► bytes ──decode──► Envelope
//!      │                                                            │
//!      └────────────── identity_of(kind, ts, sender, payload) ◄─────┘
//!                                   │
//!                                   ▼
//!                               ContentId  (dedup key)
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: `Envelope`, `MessageKind` and per-kind `RetentionPolicy`
//! - [`codec`]: deterministic bincode wire format
//! - [`identity`]: content-addressed `ContentId`

pub mod codec;
pub mod envelope;
pub mod identity;

pub use codec::{decode, encode, DecodeError, EncodeError, MAX_FRAME_BYTES};
pub use envelope::{now_millis, Envelope, MessageKind, RetentionPolicy, UnknownKind};
pub use identity::{identity_of, ContentId};
