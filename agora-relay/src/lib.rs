//! # agora-relay: reliable multi-room messaging over a shared pub/sub node
//!
//! The transport underneath delivers every send to all live subscribers at
//! least once, possibly more than once and in any order. This crate turns
//! that into something an application can build on:
//!
//! ```text
//!  app ──send──► RelaySession ──encode──► channel(room) ──► transport
//!                    │   ▲                                     │
//!                    │   └── callbacks ◄── DeliveryTracker ◄───┤ lifecycle
//!                    │                                         │
//!  app ◄──listeners──┴──── DedupStore ◄── identity ◄── decode ◄┘ received
//!                              │
//!                              └──► Persister ──► KeyValueStore
//!
//!  every event ──► ObservabilityBus        node health ──► HealthMonitor
//! ```
//!
//! ## Modules
//!
//! - [`session`]: `RelaySession`, node lifecycle, rooms, send/receive paths
//! - [`transport`]: the consumed transport surface and a loopback transport
//! - [`dedup`]: bounded per-room history of content identities
//! - [`delivery`]: send-handle → callback tracking
//! - [`health`]: process-wide connectivity flag
//! - [`observe`]: observability event bus
//! - [`storage`]: key-value backends and the write-behind persister

pub mod config;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod health;
mod listeners;
pub mod observe;
mod room;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::RelayConfig;
pub use dedup::{DedupStore, DEFAULT_DEDUP_CAPACITY};
pub use delivery::{DeliveryCallbacks, DeliveryState, DeliveryTracker};
pub use error::{RelayError, SendError};
pub use health::HealthMonitor;
pub use listeners::ListenerId;
pub use observe::{ObservabilityBus, ObservedEvent, ObservedKind};
pub use room::RoomStats;
pub use session::RelaySession;
pub use storage::{KeyValueStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{
    ChannelEvent, HealthStatus, LoopbackConfig, LoopbackNetwork, MessageHandle, Transport,
    TransportError,
};
