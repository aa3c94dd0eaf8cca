//! Per-room aggregate.
//!
//! Everything a joined room owns lives here and is released together on
//! leave: the transport channel, message listeners, dedup history and the
//! delivery tracker. Only the dedup history outlives the room, in storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agora_core::{decode, ContentId, DecodeError, Envelope, RetentionPolicy};
use serde::Serialize;

use crate::dedup::DedupStore;
use crate::delivery::{DeliveryNotice, DeliveryTracker};
use crate::listeners::ListenerSet;
use crate::storage::Persister;
use crate::transport::{ChannelEvent, TransportChannel};

pub type MessageListener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Room counters, as of the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub sent: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub received: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
    pub pending_sends: usize,
    pub listeners: usize,
    pub dedup_entries: usize,
}

#[derive(Default)]
struct AtomicRoomStats {
    sent: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    decode_failures: AtomicU64,
}

/// What the receive path decided for one inbound payload.
pub(crate) enum ReceiveOutcome {
    /// Novel message; `listeners` is the fan-out snapshot.
    Delivered {
        envelope: Envelope,
        identity: ContentId,
        listeners: Vec<MessageListener>,
    },
    Duplicate { identity: ContentId },
    DecodeFailed(DecodeError),
}

pub(crate) struct Room {
    /// Distinguishes this membership from earlier joins of the same room.
    pub epoch: u64,
    /// Set once the room is left; a departed room accepts no further work.
    pub departed: bool,
    pub sender_id: String,
    pub channel: Box<dyn TransportChannel>,
    pub listeners: ListenerSet<MessageListener>,
    pub delivery: DeliveryTracker,
    dedup: Arc<Mutex<DedupStore>>,
    persister: Persister,
    stats: Arc<AtomicRoomStats>,
}

impl Room {
    pub fn new(
        epoch: u64,
        sender_id: impl Into<String>,
        channel: Box<dyn TransportChannel>,
        dedup: DedupStore,
        persister: Persister,
    ) -> Self {
        Self {
            epoch,
            departed: false,
            sender_id: sender_id.into(),
            channel,
            listeners: ListenerSet::default(),
            delivery: DeliveryTracker::new(),
            dedup: Arc::new(Mutex::new(dedup)),
            persister,
            stats: Arc::new(AtomicRoomStats::default()),
        }
    }

    fn dedup(&self) -> MutexGuard<'_, DedupStore> {
        self.dedup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode, identify and dedup one inbound payload.
    ///
    /// Novel `Persisted` identities mark the room's history dirty; the
    /// persister renders it once per batch.
    pub fn receive(&mut self, payload: &[u8]) -> ReceiveOutcome {
        let envelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                return ReceiveOutcome::DecodeFailed(e);
            }
        };
        let identity = envelope.identity();
        let retention = envelope.retention();
        let key = {
            let mut dedup = self.dedup();
            if !dedup.insert(identity.clone(), retention) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return ReceiveOutcome::Duplicate { identity };
            }
            dedup.key().to_string()
        };
        if retention == RetentionPolicy::Persisted {
            self.persister.mark_dirty(key, self.dedup.clone());
        }
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        ReceiveOutcome::Delivered {
            envelope,
            identity,
            listeners: self.listeners.snapshot(),
        }
    }

    /// Feed a lifecycle event to the tracker.
    pub fn observe_lifecycle(&mut self, event: &ChannelEvent) -> Option<DeliveryNotice> {
        let notice = self.delivery.observe(event)?;
        match event {
            ChannelEvent::Acknowledged(_) => {
                self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            ChannelEvent::IrrecoverableError { .. } => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Some(notice)
    }

    pub fn record_sent(&self) {
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            sent: self.stats.sent.load(Ordering::Relaxed),
            acknowledged: self.stats.acknowledged.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
            pending_sends: self.delivery.pending_count(),
            listeners: self.listeners.len(),
            dedup_entries: self.dedup().len(),
        }
    }
}
