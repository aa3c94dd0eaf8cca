//! In-memory transport.
//!
//! Every node created from the same [`LoopbackNetwork`] shares one hub, so
//! several sessions in one process can talk to each other. The hub routes a
//! send to every channel bound to the same `(topic, room)` pair, including
//! the sender's own channel when `echo_to_sender` is set, which mirrors how
//! a relay network reflects a node's own publications back to it.
//!
//! The network also exposes the hooks a test needs to play the part of the
//! real network: health changes, raw redelivery and arbitrary lifecycle
//! events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{
    ChannelBinding, ChannelEvent, HealthStatus, MessageHandle, NodeConfig, TopicDecoder,
    TopicEncoder, Transport, TransportChannel, TransportError, TransportNode,
};

/// Loopback behaviour switches.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Emit `possibly-acknowledged` and `acknowledged` right after a send.
    pub auto_acknowledge: bool,
    /// Deliver a node's own sends back to its channel as `received`.
    pub echo_to_sender: bool,
    /// New nodes report `SufficientlyHealthy` immediately.
    pub start_healthy: bool,
    /// `create_node` fails.
    pub fail_start: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            auto_acknowledge: true,
            echo_to_sender: true,
            start_healthy: true,
            fail_start: false,
        }
    }
}

impl LoopbackConfig {
    /// Lifecycle events are left to the test to inject.
    pub fn manual_acks() -> Self {
        Self {
            auto_acknowledge: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    topic: String,
    room_id: String,
}

struct Route {
    channel_id: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

struct NodeShared {
    health: Mutex<HealthStatus>,
    health_tx: broadcast::Sender<HealthStatus>,
    stopped: AtomicBool,
}

impl NodeShared {
    fn set_health(&self, status: HealthStatus) {
        if let Ok(mut health) = self.health.lock() {
            *health = status;
        }
        let _ = self.health_tx.send(status);
    }

    fn health(&self) -> HealthStatus {
        self.health
            .lock()
            .map(|h| *h)
            .unwrap_or(HealthStatus::Unhealthy)
    }
}

struct Hub {
    config: LoopbackConfig,
    routes: Mutex<HashMap<RouteKey, Vec<Route>>>,
    nodes: Mutex<Vec<Arc<NodeShared>>>,
    next_channel_id: AtomicU64,
    sends: AtomicU64,
    nodes_created: AtomicU64,
    fail_sends: AtomicBool,
}

impl Hub {
    fn add_route(&self, key: RouteKey, tx: mpsc::UnboundedSender<ChannelEvent>) -> u64 {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut routes) = self.routes.lock() {
            routes.entry(key).or_default().push(Route { channel_id, tx });
        }
        channel_id
    }

    fn remove_route(&self, key: &RouteKey, channel_id: u64) {
        if let Ok(mut routes) = self.routes.lock() {
            if let Some(list) = routes.get_mut(key) {
                list.retain(|r| r.channel_id != channel_id);
                if list.is_empty() {
                    routes.remove(key);
                }
            }
        }
    }

    /// Deliver to every channel on `key`, optionally skipping one.
    fn deliver(&self, key: &RouteKey, event: &ChannelEvent, skip: Option<u64>) -> usize {
        let Ok(routes) = self.routes.lock() else {
            return 0;
        };
        routes
            .get(key)
            .map(|list| {
                list.iter()
                    .filter(|r| Some(r.channel_id) != skip)
                    .filter(|r| r.tx.send(event.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    fn deliver_to_room(&self, room_id: &str, event: &ChannelEvent) -> usize {
        let Ok(routes) = self.routes.lock() else {
            return 0;
        };
        routes
            .iter()
            .filter(|(key, _)| key.room_id == room_id)
            .flat_map(|(_, list)| list.iter())
            .filter(|r| r.tx.send(event.clone()).is_ok())
            .count()
    }
}

/// Shared in-memory network; cheap to clone.
#[derive(Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Hub>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackNetwork {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            hub: Arc::new(Hub {
                config,
                routes: Mutex::new(HashMap::new()),
                nodes: Mutex::new(Vec::new()),
                next_channel_id: AtomicU64::new(1),
                sends: AtomicU64::new(0),
                nodes_created: AtomicU64::new(0),
                fail_sends: AtomicBool::new(false),
            }),
        }
    }

    /// Report `status` from every live node.
    pub fn set_health(&self, status: HealthStatus) {
        if let Ok(nodes) = self.hub.nodes.lock() {
            for node in nodes.iter() {
                node.set_health(status);
            }
        }
    }

    /// Push an event into every channel bound to `room_id`.
    ///
    /// Returns the number of channels reached.
    pub fn inject(&self, room_id: &str, event: ChannelEvent) -> usize {
        self.hub.deliver_to_room(room_id, &event)
    }

    /// Simulate network-level redelivery of a raw frame.
    pub fn redeliver(&self, room_id: &str, payload: Vec<u8>) -> usize {
        self.inject(room_id, ChannelEvent::Received { payload })
    }

    /// Make every subsequent send fail at call time.
    pub fn set_fail_sends(&self, fail: bool) {
        self.hub.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Number of sends accepted by any channel.
    pub fn send_count(&self) -> u64 {
        self.hub.sends.load(Ordering::Relaxed)
    }

    /// Number of nodes ever created.
    pub fn nodes_created(&self) -> u64 {
        self.hub.nodes_created.load(Ordering::Relaxed)
    }

    /// Number of live channels bound to `room_id`.
    pub fn channel_count(&self, room_id: &str) -> usize {
        self.hub
            .routes
            .lock()
            .map(|routes| {
                routes
                    .iter()
                    .filter(|(key, _)| key.room_id == room_id)
                    .map(|(_, list)| list.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Distinct content topics with at least one live channel.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .hub
            .routes
            .lock()
            .map(|routes| routes.keys().map(|k| k.topic.clone()).collect())
            .unwrap_or_default();
        topics.sort();
        topics.dedup();
        topics
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn create_node(&self, config: NodeConfig) -> Result<Arc<dyn TransportNode>, TransportError> {
        if self.hub.config.fail_start {
            return Err(TransportError::NodeStart(
                "loopback network configured to refuse nodes".into(),
            ));
        }
        let initial = if self.hub.config.start_healthy {
            HealthStatus::SufficientlyHealthy
        } else {
            HealthStatus::Unhealthy
        };
        let (health_tx, _) = broadcast::channel(16);
        let shared = Arc::new(NodeShared {
            health: Mutex::new(initial),
            health_tx,
            stopped: AtomicBool::new(false),
        });
        if let Ok(mut nodes) = self.hub.nodes.lock() {
            nodes.push(shared.clone());
        }
        self.hub.nodes_created.fetch_add(1, Ordering::Relaxed);
        log::debug!("loopback node created (bootstrap={})", config.bootstrap);

        Ok(Arc::new(LoopbackNode {
            hub: self.hub.clone(),
            shared,
        }))
    }
}

struct LoopbackNode {
    hub: Arc<Hub>,
    shared: Arc<NodeShared>,
}

#[async_trait]
impl TransportNode for LoopbackNode {
    fn subscribe_health(&self) -> broadcast::Receiver<HealthStatus> {
        self.shared.health_tx.subscribe()
    }

    fn current_health(&self) -> HealthStatus {
        self.shared.health()
    }

    async fn create_channel(
        &self,
        room_id: &str,
        sender_id: &str,
        encoder: &TopicEncoder,
        decoder: &TopicDecoder,
    ) -> Result<ChannelBinding, TransportError> {
        if self.shared.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }
        if encoder.content_topic != decoder.content_topic {
            return Err(TransportError::ChannelCreation {
                room_id: room_id.to_string(),
                reason: "encoder and decoder are bound to different topics".into(),
            });
        }

        let key = RouteKey {
            topic: decoder.content_topic.clone(),
            room_id: room_id.to_string(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let channel_id = self.hub.add_route(key.clone(), tx.clone());
        log::debug!("loopback channel {channel_id} bound to room {room_id} for {sender_id}");

        Ok(ChannelBinding {
            channel: Box::new(LoopbackChannel {
                hub: self.hub.clone(),
                node: self.shared.clone(),
                key,
                channel_id,
                tx,
            }),
            events: rx,
        })
    }

    async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
        self.shared.set_health(HealthStatus::Unhealthy);
        if let Ok(mut nodes) = self.hub.nodes.lock() {
            nodes.retain(|n| !Arc::ptr_eq(n, &self.shared));
        }
    }
}

struct LoopbackChannel {
    hub: Arc<Hub>,
    node: Arc<NodeShared>,
    key: RouteKey,
    channel_id: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl TransportChannel for LoopbackChannel {
    async fn send(&self, payload: Vec<u8>) -> Result<MessageHandle, TransportError> {
        if self.node.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }
        if self.hub.fail_sends.load(Ordering::Relaxed) {
            return Err(TransportError::SendRejected("loopback sends disabled".into()));
        }
        self.hub.sends.fetch_add(1, Ordering::Relaxed);

        let handle = MessageHandle::random();
        let _ = self.tx.send(ChannelEvent::Sending(handle.clone()));
        let _ = self.tx.send(ChannelEvent::Sent(handle.clone()));

        let skip = (!self.hub.config.echo_to_sender).then_some(self.channel_id);
        let reached = self
            .hub
            .deliver(&self.key, &ChannelEvent::Received { payload }, skip);

        if self.hub.config.auto_acknowledge {
            let _ = self.tx.send(ChannelEvent::PossiblyAcknowledged {
                handle: handle.clone(),
                count: reached.max(1) as u32,
            });
            let _ = self.tx.send(ChannelEvent::Acknowledged(handle.clone()));
        }
        Ok(handle)
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.hub.remove_route(&self.key, self.channel_id);
    }
}
