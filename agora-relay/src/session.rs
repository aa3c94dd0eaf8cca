//! Session manager: one transport node, many rooms.
//!
//! ```text
//!                       RelaySession (cloneable handle)
//!                                 │
//!        ┌────────────────────────┼─────────────────────────┐
//!        ▼                        ▼                         ▼
//!   NodeRuntime             rooms: room_id → Room     HealthMonitor
//!   node + encoder/decoder        │                   ObservabilityBus
//!   persister, health task        │
//!                                 ▼
//!          one dispatch task per room, draining its channel events:
//!            received  → decode → identity → dedup → fan-out
//!            lifecycle → tracker → callbacks
//!            every event → observability
//! ```
//!
//! The `rooms` map lock is held only to look a room up, join or leave.
//! Each room has its own lock, so a slow send in one room never stalls
//! dispatch in another. Listeners and callbacks are snapshotted under the
//! room lock and invoked after it is released, so they may call back into
//! the session.
//!
//! A dispatch task remembers the epoch of the membership it was started for.
//! Once the room is left (or left and joined again) its remaining events
//! still reach the observability bus but no longer touch room state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use agora_core::{encode, Envelope, MessageKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::dedup::DedupStore;
use crate::delivery::DeliveryCallbacks;
use crate::error::{RelayError, SendError};
use crate::health::HealthMonitor;
use crate::listeners::{invoke_isolated, ListenerId};
use crate::observe::{ObservabilityBus, ObservedKind};
use crate::room::{ReceiveOutcome, Room, RoomStats};
use crate::storage::{storage_key, KeyValueStore, MemoryStore, Persister};
use crate::transport::{
    ChannelEvent, ChannelEvents, HealthStatus, MessageHandle, NodeConfig, TopicDecoder,
    TopicEncoder, Transport, TransportNode,
};

struct NodeRuntime {
    node: Arc<dyn TransportNode>,
    encoder: TopicEncoder,
    decoder: TopicDecoder,
    persister: Persister,
    health_task: JoinHandle<()>,
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.health_task.abort();
    }
}

type RoomSlot = Arc<Mutex<Room>>;

struct SessionInner {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn KeyValueStore>,
    runtime: Mutex<Option<Arc<NodeRuntime>>>,
    rooms: Mutex<HashMap<String, RoomSlot>>,
    health: HealthMonitor,
    bus: ObservabilityBus,
    next_epoch: AtomicU64,
}

/// Handle to a relay session. Clones share the same node and rooms.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<SessionInner>,
}

impl RelaySession {
    pub fn new(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let bus = ObservabilityBus::new(config.observability_capacity, config.observability_history);
        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                store,
                runtime: Mutex::new(None),
                rooms: Mutex::new(HashMap::new()),
                health: HealthMonitor::new(),
                bus,
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Session whose dedup history lives only in this process.
    pub fn with_memory_store(config: RelayConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(config, transport, Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Start the shared node. Later calls return at once.
    ///
    /// A node start failure is returned as-is and not retried; the next call
    /// tries again from scratch.
    pub async fn initialize(&self) -> Result<(), RelayError> {
        self.runtime().await.map(|_| ())
    }

    async fn runtime(&self) -> Result<Arc<NodeRuntime>, RelayError> {
        let mut slot = self.inner.runtime.lock().await;
        if let Some(runtime) = slot.as_ref() {
            return Ok(runtime.clone());
        }

        let config = &self.inner.config;
        log::info!("Starting transport node on topic {}", config.topic);
        let node = self
            .inner
            .transport
            .create_node(NodeConfig {
                bootstrap: config.bootstrap,
            })
            .await
            .map_err(|e| {
                log::error!("Transport node failed to start: {e}");
                RelayError::Initialization(e)
            })?;
        let encoder = node.create_encoder(&config.topic);
        let decoder = node.create_decoder(&config.topic);

        // Subscribe before reading the current status so no transition is missed.
        let health_rx = node.subscribe_health();
        self.inner.apply_health(node.current_health());
        let health_task = tokio::spawn(watch_health(
            Arc::downgrade(&self.inner),
            node.clone(),
            health_rx,
        ));

        let runtime = Arc::new(NodeRuntime {
            node,
            encoder,
            decoder,
            persister: Persister::spawn(self.inner.store.clone()),
            health_task,
        });
        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    /// Join `room_id` as `sender_id`, starting the node if needed.
    ///
    /// Joining a room that is already joined does nothing.
    pub async fn join(&self, room_id: &str, sender_id: &str) -> Result<(), RelayError> {
        let runtime = self.runtime().await?;
        let mut rooms = self.inner.rooms.lock().await;
        if rooms.contains_key(room_id) {
            log::debug!("Room {room_id} already joined");
            return Ok(());
        }

        let binding = runtime
            .node
            .create_channel(room_id, sender_id, &runtime.encoder, &runtime.decoder)
            .await
            .map_err(RelayError::ChannelCreation)?;

        // A write queued by an earlier leave must land before we read.
        runtime.persister.flush().await;
        let key = storage_key(&self.inner.config.storage_namespace, room_id);
        let capacity = self.inner.config.dedup_capacity;
        let store = self.inner.store.clone();
        let load_key = key.clone();
        let dedup = tokio::task::spawn_blocking(move || {
            DedupStore::load(store.as_ref(), load_key, capacity)
        })
        .await
        .unwrap_or_else(|e| {
            log::warn!("Dedup load for {room_id} did not complete: {e}");
            DedupStore::new(key, capacity)
        });

        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Joined room {room_id} as {sender_id} ({} known messages)",
            dedup.len()
        );
        rooms.insert(
            room_id.to_string(),
            Arc::new(Mutex::new(Room::new(
                epoch,
                sender_id,
                binding.channel,
                dedup,
                runtime.persister.clone(),
            ))),
        );
        drop(rooms);

        tokio::spawn(dispatch(
            Arc::downgrade(&self.inner),
            room_id.to_string(),
            epoch,
            binding.events,
        ));
        self.inner.bus.emit(
            Some(room_id),
            ObservedKind::Joined {
                sender_id: sender_id.to_string(),
            },
        );
        Ok(())
    }

    /// Release the room's channel, listeners, dedup set and pending sends.
    ///
    /// Persisted dedup history is kept for a later join. Returns `false` if
    /// the room was not joined.
    pub async fn leave(&self, room_id: &str) -> bool {
        let Some(slot) = self.inner.rooms.lock().await.remove(room_id) else {
            return false;
        };
        // Waits out a send still in progress in this room.
        let mut room = slot.lock_owned().await;
        room.departed = true;
        let abandoned = room.delivery.pending_count();
        if abandoned > 0 {
            log::debug!("Leaving {room_id} with {abandoned} sends still in flight");
        }
        let persister = room.persister().clone();
        drop(room);
        persister.flush().await;

        log::info!("Left room {room_id}");
        self.inner.bus.emit(Some(room_id), ObservedKind::Left);
        true
    }

    /// Encode `envelope` as `sender_id` and hand it to the room's channel.
    ///
    /// The returned handle is the one `callbacks` are attached to. A
    /// transport that refuses the payload outright yields
    /// [`SendError::Rejected`]; later failures go to `callbacks` only.
    pub async fn send(
        &self,
        room_id: &str,
        mut envelope: Envelope,
        sender_id: &str,
        callbacks: DeliveryCallbacks,
    ) -> Result<MessageHandle, RelayError> {
        if envelope.sender_id != sender_id {
            envelope.sender_id = sender_id.to_string();
        }
        let mut room = self.inner.joined(room_id).await?;
        Self::send_in(room_id, &mut room, &envelope, callbacks).await
    }

    /// Send a new message stamped with the current time and the sender id
    /// the room was joined with.
    pub async fn publish(
        &self,
        room_id: &str,
        kind: MessageKind,
        payload: impl Into<String>,
        callbacks: DeliveryCallbacks,
    ) -> Result<MessageHandle, RelayError> {
        let payload = payload.into();
        let mut room = self.inner.joined(room_id).await?;
        let envelope = Envelope::now(kind, room.sender_id.clone(), payload);
        Self::send_in(room_id, &mut room, &envelope, callbacks).await
    }

    // Runs under the room lock, so no lifecycle event for the new handle
    // is dispatched before its callbacks are registered.
    async fn send_in(
        room_id: &str,
        room: &mut Room,
        envelope: &Envelope,
        callbacks: DeliveryCallbacks,
    ) -> Result<MessageHandle, RelayError> {
        let bytes = encode(envelope)?;
        let handle = match room.channel.send(bytes).await {
            Ok(handle) => handle,
            Err(e) => {
                room.record_rejected();
                log::warn!("Send to {room_id} rejected: {e}");
                return Err(SendError::Rejected(e).into());
            }
        };
        room.delivery.register(handle.clone(), callbacks);
        room.record_sent();
        log::debug!("Sent {} to {room_id} as {handle}", envelope.kind);
        Ok(handle)
    }

    /// Register a listener for novel messages in `room_id`.
    ///
    /// Only messages arriving after registration are delivered.
    pub async fn on_message<F>(&self, room_id: &str, listener: F) -> Result<ListenerId, RelayError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut room = self.inner.joined(room_id).await?;
        Ok(room.listeners.insert(Arc::new(listener)))
    }

    pub async fn off_message(&self, room_id: &str, id: ListenerId) -> bool {
        match self.inner.lock_room(room_id).await {
            Some(mut room) => room.listeners.remove(id),
            None => false,
        }
    }

    /// Register a connectivity listener. It is called right away with the
    /// current state, then on every transition.
    pub fn on_health_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.health.subscribe(Arc::new(listener))
    }

    pub fn off_health_change(&self, id: ListenerId) -> bool {
        self.inner.health.unsubscribe(id)
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.health.is_healthy()
    }

    pub fn observability(&self) -> &ObservabilityBus {
        &self.inner.bus
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.runtime.lock().await.is_some()
    }

    /// Joined rooms, sorted.
    pub async fn joined_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.inner.rooms.lock().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub async fn is_joined(&self, room_id: &str) -> bool {
        self.inner.rooms.lock().await.contains_key(room_id)
    }

    /// Sends in `room_id` still waiting for a terminal event.
    pub async fn pending_sends(&self, room_id: &str) -> Option<usize> {
        let room = self.inner.lock_room(room_id).await?;
        Some(room.delivery.pending_count())
    }

    pub async fn room_stats(&self, room_id: &str) -> Option<RoomStats> {
        let room = self.inner.lock_room(room_id).await?;
        Some(room.stats())
    }

    /// Wait for queued dedup writes to reach storage.
    pub async fn flush(&self) {
        let runtime = self.inner.runtime.lock().await.clone();
        if let Some(runtime) = runtime {
            runtime.persister.flush().await;
        }
    }

    /// Leave every room, stop the node and reset health to `false`.
    ///
    /// The session may be initialized again afterwards.
    pub async fn shutdown(&self) {
        let rooms: Vec<(String, RoomSlot)> = self.inner.rooms.lock().await.drain().collect();
        let runtime = self.inner.runtime.lock().await.take();

        for (room_id, slot) in rooms {
            slot.lock().await.departed = true;
            drop(slot);
            self.inner.bus.emit(Some(&room_id), ObservedKind::Left);
        }
        if let Some(runtime) = runtime {
            runtime.health_task.abort();
            runtime.node.stop().await;
            runtime.persister.flush().await;
        }
        self.inner.health.reset();
        log::info!("Relay session shut down");
    }
}

impl SessionInner {
    /// Lock a room that is still joined. The map lock is released before
    /// the room lock is awaited.
    async fn lock_room(&self, room_id: &str) -> Option<OwnedMutexGuard<Room>> {
        let slot = self.rooms.lock().await.get(room_id).cloned()?;
        let room = slot.lock_owned().await;
        (!room.departed).then_some(room)
    }

    async fn joined(&self, room_id: &str) -> Result<OwnedMutexGuard<Room>, RelayError> {
        self.lock_room(room_id)
            .await
            .ok_or_else(|| RelayError::NotJoined(room_id.to_string()))
    }

    /// Lock the room only if it is still the membership `epoch` belongs to.
    async fn lock_epoch(&self, room_id: &str, epoch: u64) -> Option<OwnedMutexGuard<Room>> {
        self.lock_room(room_id)
            .await
            .filter(|room| room.epoch == epoch)
    }

    fn apply_health(&self, status: HealthStatus) {
        let healthy = status.is_sufficient();
        self.bus.emit(None, ObservedKind::Health { status, healthy });
        self.health.apply(healthy);
    }

    async fn handle_event(&self, room_id: &str, epoch: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Received { payload } => self.handle_received(room_id, epoch, &payload).await,
            lifecycle => self.handle_lifecycle(room_id, epoch, &lifecycle).await,
        }
    }

    async fn handle_lifecycle(&self, room_id: &str, epoch: u64, event: &ChannelEvent) {
        if let Some(kind) = ObservedKind::from_lifecycle(event) {
            self.bus.emit(Some(room_id), kind);
        }
        match event {
            ChannelEvent::IrrecoverableError { handle, error } => {
                log::warn!("Send {handle} in {room_id} failed: {error}");
            }
            ChannelEvent::Irretrievable { detail } => {
                log::warn!("Irretrievable message in {room_id}: {detail}");
            }
            _ => {}
        }

        let notice = match self.lock_epoch(room_id, epoch).await {
            Some(mut room) => room.observe_lifecycle(event),
            None => None,
        };
        if let Some(notice) = notice {
            notice.fire();
        }
    }

    async fn handle_received(&self, room_id: &str, epoch: u64, payload: &[u8]) {
        let outcome = match self.lock_epoch(room_id, epoch).await {
            Some(mut room) => room.receive(payload),
            None => {
                log::debug!("Dropping message for departed room {room_id}");
                self.bus.emit(
                    Some(room_id),
                    ObservedKind::Discarded {
                        bytes: payload.len(),
                    },
                );
                return;
            }
        };

        match outcome {
            ReceiveOutcome::Delivered {
                envelope,
                identity,
                listeners,
            } => {
                self.bus.emit(
                    Some(room_id),
                    ObservedKind::Received {
                        identity,
                        sender_id: envelope.sender_id.clone(),
                        message_kind: envelope.kind,
                    },
                );
                for listener in listeners {
                    invoke_isolated("message listener", || listener(&envelope));
                }
            }
            ReceiveOutcome::Duplicate { identity } => {
                log::debug!("Duplicate {identity} in {room_id}");
                self.bus.emit(Some(room_id), ObservedKind::Duplicate { identity });
            }
            ReceiveOutcome::DecodeFailed(e) => {
                log::warn!("Dropping undecodable message in {room_id}: {e}");
                self.bus.emit(
                    Some(room_id),
                    ObservedKind::DecodeFailed {
                        error: e.to_string(),
                    },
                );
            }
        }
    }
}

async fn dispatch(session: Weak<SessionInner>, room_id: String, epoch: u64, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.handle_event(&room_id, epoch, event).await;
    }
    log::debug!("Dispatch for {room_id} (epoch {epoch}) finished");
}

async fn watch_health(
    session: Weak<SessionInner>,
    node: Arc<dyn TransportNode>,
    mut rx: broadcast::Receiver<HealthStatus>,
) {
    loop {
        let status = match rx.recv().await {
            Ok(status) => status,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Missed {skipped} health reports; re-reading current status");
                node.current_health()
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.apply_health(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;

    #[tokio::test]
    async fn test_stale_payload_is_recorded_as_discarded() {
        let session = RelaySession::with_memory_store(
            RelayConfig::for_testing(),
            Arc::new(LoopbackNetwork::default()),
        );
        session.join("R1", "u1").await.unwrap();
        let live = session.inner.lock_room("R1").await.unwrap().epoch;

        let stale = ChannelEvent::Received {
            payload: vec![1, 2, 3],
        };
        session.inner.handle_event("R1", live + 100, stale).await;
        let gone = ChannelEvent::Received { payload: vec![0; 8] };
        session.inner.handle_event("GONE", 1, gone).await;

        let discarded: Vec<_> = session
            .observability()
            .recent()
            .into_iter()
            .filter_map(|e| match e.kind {
                ObservedKind::Discarded { bytes } => Some((e.room_id, bytes)),
                _ => None,
            })
            .collect();
        assert_eq!(
            discarded,
            vec![(Some("R1".to_string()), 3), (Some("GONE".to_string()), 8)]
        );
        let stats = session.room_stats("R1").await.unwrap();
        assert_eq!(stats.received + stats.decode_failures, 0);
    }

    #[tokio::test]
    async fn test_left_room_rejects_work() {
        let session = RelaySession::with_memory_store(
            RelayConfig::for_testing(),
            Arc::new(LoopbackNetwork::default()),
        );
        session.join("R1", "u1").await.unwrap();
        let slot = session.inner.rooms.lock().await.get("R1").cloned().unwrap();
        assert!(session.leave("R1").await);

        assert!(slot.lock().await.departed);
        assert!(session.inner.lock_room("R1").await.is_none());
        let err = session
            .publish("R1", MessageKind::Ping, "{}", DeliveryCallbacks::new())
            .await
            .unwrap_err();
        assert!(err.is_not_joined());
    }
}
