//! Session integration tests over the loopback transport.
//!
//! Verifies:
//! - Echoed sends reach listeners exactly once
//! - Raw redelivery is deduplicated, including across leave/join
//! - Sends before join never reach the transport
//! - Delivery callbacks fire once per handle and are reclaimed
//! - Health transitions and shutdown reset
//! - One node and one topic shared by every room

use std::sync::Arc;
use std::time::Duration;

use agora_core::{encode, Envelope, MessageKind};
use agora_relay::storage::KeyValueStore;
use agora_relay::transport::{
    ChannelBinding, NodeConfig, TopicDecoder, TopicEncoder, TransportChannel, TransportNode,
};
use agora_relay::{
    ChannelEvent, DeliveryCallbacks, HealthStatus, LoopbackConfig, LoopbackNetwork, MemoryStore,
    MessageHandle, ObservedKind, RelayConfig, RelayError, RelaySession, SendError, Transport,
    TransportError,
};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn session(net: &LoopbackNetwork) -> RelaySession {
    RelaySession::with_memory_store(RelayConfig::for_testing(), Arc::new(net.clone()))
}

async fn listen(session: &RelaySession, room: &str) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    session
        .on_message(room, move |env| {
            let _ = tx.send(env.clone());
        })
        .await
        .unwrap();
    rx
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

fn envelope(kind: MessageKind, ts: u64, sender: &str) -> Envelope {
    Envelope::new(kind, ts, sender, "{}")
}

/// Redeliver a distinct frame and wait for it; everything queued before it
/// in the same room has been processed once it arrives.
async fn settle(net: &LoopbackNetwork, room: &str, rx: &mut mpsc::UnboundedReceiver<Envelope>, ts: u64) {
    let marker = envelope(MessageKind::Ping, ts, "marker");
    net.redeliver(room, encode(&marker).unwrap());
    assert_eq!(next(rx).await, marker);
}

fn recorder(tag: &'static str, tx: &mpsc::UnboundedSender<String>) -> DeliveryCallbacks {
    let (a, b, c, d) = (tx.clone(), tx.clone(), tx.clone(), tx.clone());
    DeliveryCallbacks::new()
        .on_sending(move |_| {
            let _ = a.send(format!("{tag}:sending"));
        })
        .on_sent(move |_| {
            let _ = b.send(format!("{tag}:sent"));
        })
        .on_acknowledged(move |_| {
            let _ = c.send(format!("{tag}:ack"));
        })
        .on_error(move |_, e| {
            let _ = d.send(format!("{tag}:error:{e}"));
        })
}

// ─── Receive path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_echoed_send_delivered_once() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    let mut rx = listen(&session, "R1").await;

    let sent = envelope(MessageKind::Ping, 1000, "u1");
    session
        .send("R1", sent.clone(), "u1", DeliveryCallbacks::new())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, sent);
    settle(&net, "R1", &mut rx, 2000).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_raw_redelivery_is_deduplicated() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    let mut rx = listen(&session, "R1").await;

    let env = envelope(MessageKind::Question, 1000, "u2");
    let bytes = encode(&env).unwrap();
    net.redeliver("R1", bytes.clone());
    net.redeliver("R1", bytes);

    assert_eq!(next(&mut rx).await, env);
    settle(&net, "R1", &mut rx, 2000).await;
    assert!(rx.try_recv().is_err());

    let stats = session.room_stats("R1").await.unwrap();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.duplicates, 1);

    let duplicates = session
        .observability()
        .recent()
        .into_iter()
        .filter(|e| matches!(e.kind, ObservedKind::Duplicate { .. }))
        .count();
    assert_eq!(duplicates, 1);
}

#[tokio::test]
async fn test_rejoin_remembers_persisted_messages() {
    let net = LoopbackNetwork::default();
    let store = Arc::new(MemoryStore::new());
    let session = RelaySession::new(RelayConfig::for_testing(), Arc::new(net.clone()), store.clone());
    session.join("R1", "u1").await.unwrap();
    let mut rx = listen(&session, "R1").await;

    let question = envelope(MessageKind::Question, 1000, "u2");
    let activation = envelope(MessageKind::Activation, 1001, "u2");
    net.redeliver("R1", encode(&question).unwrap());
    net.redeliver("R1", encode(&activation).unwrap());
    assert_eq!(next(&mut rx).await, question);
    assert_eq!(next(&mut rx).await, activation);

    assert!(session.leave("R1").await);
    let key = format!("{}_R1", RelayConfig::for_testing().storage_namespace);
    assert!(store.get(&key).unwrap().is_some());

    session.join("R1", "u1").await.unwrap();
    let mut rx = listen(&session, "R1").await;
    net.redeliver("R1", encode(&question).unwrap());
    net.redeliver("R1", encode(&activation).unwrap());

    // Idempotent state transitions are only remembered in memory.
    assert_eq!(next(&mut rx).await, activation);
    settle(&net, "R1", &mut rx, 3000).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_undecodable_payload_dropped() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    let mut rx = listen(&session, "R1").await;

    net.redeliver("R1", vec![0xde, 0xad]);
    settle(&net, "R1", &mut rx, 1).await;

    assert_eq!(session.room_stats("R1").await.unwrap().decode_failures, 1);
    assert!(session
        .observability()
        .recent()
        .iter()
        .any(|e| matches!(e.kind, ObservedKind::DecodeFailed { .. })));
}

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    session
        .on_message("R1", |_| panic!("listener failure"))
        .await
        .unwrap();
    let mut rx = listen(&session, "R1").await;

    let env = envelope(MessageKind::Answer, 5, "u2");
    net.redeliver("R1", encode(&env).unwrap());
    assert_eq!(next(&mut rx).await, env);

    let env = envelope(MessageKind::Answer, 6, "u2");
    net.redeliver("R1", encode(&env).unwrap());
    assert_eq!(next(&mut rx).await, env);
}

#[tokio::test]
async fn test_off_message_stops_delivery() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();

    let (tx, mut removed_rx) = mpsc::unbounded_channel();
    let id = session
        .on_message("R1", move |env| {
            let _ = tx.send(env.clone());
        })
        .await
        .unwrap();
    let mut rx = listen(&session, "R1").await;

    assert!(session.off_message("R1", id).await);
    assert!(!session.off_message("R1", id).await);
    settle(&net, "R1", &mut rx, 7).await;
    assert!(removed_rx.try_recv().is_err());
}

// ─── Send path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_before_join_fails_without_transport_call() {
    let net = LoopbackNetwork::default();
    let session = session(&net);

    let err = session
        .send("R1", envelope(MessageKind::Ping, 1, "u1"), "u1", DeliveryCallbacks::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotJoined(ref room) if room == "R1"));
    assert!(session.on_message("R1", |_| {}).await.unwrap_err().is_not_joined());
    assert_eq!(net.send_count(), 0);
    assert_eq!(net.nodes_created(), 0);
}

#[tokio::test]
async fn test_irrecoverable_error_reaches_only_its_handle() {
    let net = LoopbackNetwork::new(LoopbackConfig::manual_acks());
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let h1 = session
        .send("R1", envelope(MessageKind::Question, 1, "u1"), "u1", recorder("h1", &tx))
        .await
        .unwrap();
    let h2 = session
        .send("R1", envelope(MessageKind::Question, 2, "u1"), "u1", recorder("h2", &tx))
        .await
        .unwrap();
    assert_eq!(session.pending_sends("R1").await, Some(2));

    net.inject(
        "R1",
        ChannelEvent::IrrecoverableError {
            handle: h1.clone(),
            error: "no peers".into(),
        },
    );
    net.inject("R1", ChannelEvent::PossiblyAcknowledged { handle: h2.clone(), count: 1 });
    net.inject("R1", ChannelEvent::Acknowledged(h2.clone()));
    net.inject("R1", ChannelEvent::Acknowledged(h1));

    let mut seen = Vec::new();
    while !seen.iter().any(|s: &String| s == "h2:ack") {
        seen.push(next(&mut rx).await);
    }
    assert_eq!(
        seen,
        vec![
            "h1:sending",
            "h1:sent",
            "h2:sending",
            "h2:sent",
            "h1:error:irrecoverable delivery failure: no peers",
            "h2:ack",
        ]
    );

    // The stray ack for h1 lands after h2's and touches nothing.
    let mut msgs = listen(&session, "R1").await;
    settle(&net, "R1", &mut msgs, 99).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(session.pending_sends("R1").await, Some(0));

    let stats = session.room_stats("R1").await.unwrap();
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_redelivered_lifecycle_events_fire_once() {
    let net = LoopbackNetwork::new(LoopbackConfig::manual_acks());
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = session
        .send("R1", envelope(MessageKind::Answer, 1, "u1"), "u1", recorder("h", &tx))
        .await
        .unwrap();

    net.inject("R1", ChannelEvent::Sent(h.clone()));
    net.inject("R1", ChannelEvent::PossiblyAcknowledged { handle: h.clone(), count: 1 });
    net.inject("R1", ChannelEvent::Sending(h.clone()));
    net.inject("R1", ChannelEvent::Sent(h.clone()));
    net.inject("R1", ChannelEvent::Acknowledged(h.clone()));
    net.inject("R1", ChannelEvent::Acknowledged(h));

    let mut seen = Vec::new();
    while !seen.iter().any(|s: &String| s == "h:ack") {
        seen.push(next(&mut rx).await);
    }
    let mut msgs = listen(&session, "R1").await;
    settle(&net, "R1", &mut msgs, 99).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(seen, vec!["h:sending", "h:sent", "h:ack"]);
}

#[tokio::test]
async fn test_auto_ack_lifecycle_and_observability() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    let mut observed = session.observability().subscribe();
    session.join("R1", "u1").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = session
        .publish("R1", MessageKind::Answer, r#"{"text":"yes"}"#, recorder("a", &tx))
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, "a:sending");
    assert_eq!(next(&mut rx).await, "a:sent");
    assert_eq!(next(&mut rx).await, "a:ack");

    let mut names = Vec::new();
    loop {
        let event = timeout(WAIT, observed.recv()).await.unwrap().unwrap();
        let done = matches!(&event.kind, ObservedKind::Acknowledged { handle: h } if *h == handle);
        names.push(serde_json::to_value(&event).unwrap()["event"].as_str().unwrap().to_string());
        if done {
            break;
        }
    }
    for expected in ["joined", "sending", "sent", "received", "possibly_acknowledged", "acknowledged"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected} in {names:?}");
    }
}

#[tokio::test]
async fn test_publish_stamps_joined_sender() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "alice").await.unwrap();
    let mut rx = listen(&session, "R1").await;

    session
        .publish("R1", MessageKind::Upvote, "{}", DeliveryCallbacks::new())
        .await
        .unwrap();
    let got = next(&mut rx).await;
    assert_eq!(got.sender_id, "alice");
    assert_eq!(got.kind, MessageKind::Upvote);
    assert!(got.timestamp > 0);
}

#[tokio::test]
async fn test_send_uses_given_sender_id() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    let mut rx = listen(&session, "R1").await;

    session
        .send("R1", envelope(MessageKind::Ping, 10, "someone-else"), "u1", DeliveryCallbacks::new())
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.sender_id, "u1");
}

#[tokio::test]
async fn test_rejected_send_is_returned() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    net.set_fail_sends(true);

    let err = session
        .send("R1", envelope(MessageKind::Ping, 1, "u1"), "u1", DeliveryCallbacks::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Send(SendError::Rejected(_))));
    assert_eq!(session.pending_sends("R1").await, Some(0));
    assert_eq!(session.room_stats("R1").await.unwrap().failed, 1);
}

// ─── Rooms and node ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_share_one_node_and_topic() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    for room in ["R1", "R2", "R3"] {
        session.join(room, "u1").await.unwrap();
    }
    session.join("R1", "u1").await.unwrap();
    session.initialize().await.unwrap();

    assert_eq!(net.nodes_created(), 1);
    assert_eq!(net.topics(), vec![RelayConfig::for_testing().topic]);
    assert_eq!(net.channel_count("R1"), 1);
    assert_eq!(session.joined_rooms().await, vec!["R1", "R2", "R3"]);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    session.join("R2", "u1").await.unwrap();
    let mut r1 = listen(&session, "R1").await;
    let mut r2 = listen(&session, "R2").await;

    let env = envelope(MessageKind::Question, 1, "u1");
    session.send("R1", env.clone(), "u1", DeliveryCallbacks::new()).await.unwrap();
    assert_eq!(next(&mut r1).await, env);

    settle(&net, "R2", &mut r2, 2).await;
    assert!(r2.try_recv().is_err());
}

#[tokio::test]
async fn test_two_sessions_exchange_messages() {
    let net = LoopbackNetwork::default();
    let alice = session(&net);
    let bob = session(&net);
    alice.join("R1", "alice").await.unwrap();
    bob.join("R1", "bob").await.unwrap();
    let mut bob_rx = listen(&bob, "R1").await;

    let env = envelope(MessageKind::Question, 42, "alice");
    alice.send("R1", env.clone(), "alice", DeliveryCallbacks::new()).await.unwrap();
    assert_eq!(next(&mut bob_rx).await, env);
    assert_eq!(net.nodes_created(), 2);
    assert_eq!(net.channel_count("R1"), 2);
}

#[tokio::test]
async fn test_leave_releases_room() {
    let net = LoopbackNetwork::new(LoopbackConfig::manual_acks());
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    session
        .send("R1", envelope(MessageKind::Ping, 1, "u1"), "u1", DeliveryCallbacks::new())
        .await
        .unwrap();

    assert!(session.leave("R1").await);
    assert!(!session.leave("R1").await);
    assert!(!session.is_joined("R1").await);
    assert_eq!(session.pending_sends("R1").await, None);
    assert_eq!(net.channel_count("R1"), 0);
    assert!(session.is_initialized().await);
}

#[tokio::test]
async fn test_initialization_failure_surfaces() {
    let net = LoopbackNetwork::new(LoopbackConfig {
        fail_start: true,
        ..LoopbackConfig::default()
    });
    let session = session(&net);

    assert!(matches!(
        session.initialize().await,
        Err(RelayError::Initialization(_))
    ));
    assert!(matches!(
        session.join("R1", "u1").await,
        Err(RelayError::Initialization(_))
    ));
    assert!(!session.is_initialized().await);
    assert!(!session.is_healthy());
}

// ─── Health ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_transitions() {
    let net = LoopbackNetwork::new(LoopbackConfig {
        start_healthy: false,
        ..LoopbackConfig::default()
    });
    let session = session(&net);
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_health_change(move |healthy| {
        let _ = tx.send(healthy);
    });
    assert!(!next(&mut rx).await);

    session.initialize().await.unwrap();
    assert!(!session.is_healthy());

    net.set_health(HealthStatus::SufficientlyHealthy);
    assert!(next(&mut rx).await);
    net.set_health(HealthStatus::SufficientlyHealthy);
    net.set_health(HealthStatus::MinimallyHealthy);
    assert!(!next(&mut rx).await);
    net.set_health(HealthStatus::Unhealthy);
    net.set_health(HealthStatus::SufficientlyHealthy);
    assert!(next(&mut rx).await);
    assert!(session.is_healthy());

    session.shutdown().await;
    assert!(!next(&mut rx).await);
    assert!(!session.is_healthy());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_healthy_node_reported_on_initialize() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.initialize().await.unwrap();
    assert!(session.is_healthy());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = session.on_health_change(move |healthy| {
        let _ = tx.send(healthy);
    });
    assert!(next(&mut rx).await);
    assert!(session.off_health_change(id));
}

#[tokio::test]
async fn test_shutdown_then_reinitialize() {
    let net = LoopbackNetwork::default();
    let session = session(&net);
    session.join("R1", "u1").await.unwrap();
    session.join("R2", "u1").await.unwrap();

    session.shutdown().await;
    assert!(session.joined_rooms().await.is_empty());
    assert!(!session.is_initialized().await);
    assert_eq!(net.channel_count("R1"), 0);

    session.join("R1", "u1").await.unwrap();
    assert_eq!(net.nodes_created(), 2);
    assert!(session.is_healthy());
}

// ─── Room independence ───────────────────────────────────────────────────────

/// Loopback transport whose sends in one room wait for `gate`.
struct GatedTransport {
    net: LoopbackNetwork,
    room: &'static str,
    gate: Arc<Notify>,
}

struct GatedNode {
    inner: Arc<dyn TransportNode>,
    room: &'static str,
    gate: Arc<Notify>,
}

struct GatedChannel {
    inner: Box<dyn TransportChannel>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn create_node(&self, config: NodeConfig) -> Result<Arc<dyn TransportNode>, TransportError> {
        let inner = self.net.create_node(config).await?;
        Ok(Arc::new(GatedNode {
            inner,
            room: self.room,
            gate: self.gate.clone(),
        }))
    }
}

#[async_trait]
impl TransportNode for GatedNode {
    fn subscribe_health(&self) -> broadcast::Receiver<HealthStatus> {
        self.inner.subscribe_health()
    }

    fn current_health(&self) -> HealthStatus {
        self.inner.current_health()
    }

    async fn create_channel(
        &self,
        room_id: &str,
        sender_id: &str,
        encoder: &TopicEncoder,
        decoder: &TopicDecoder,
    ) -> Result<ChannelBinding, TransportError> {
        let binding = self
            .inner
            .create_channel(room_id, sender_id, encoder, decoder)
            .await?;
        let gate = (room_id == self.room).then(|| self.gate.clone());
        Ok(ChannelBinding {
            channel: Box::new(GatedChannel {
                inner: binding.channel,
                gate,
            }),
            events: binding.events,
        })
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}

#[async_trait]
impl TransportChannel for GatedChannel {
    async fn send(&self, payload: Vec<u8>) -> Result<MessageHandle, TransportError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.inner.send(payload).await
    }
}

#[tokio::test]
async fn test_stalled_send_does_not_block_other_rooms() {
    let net = LoopbackNetwork::default();
    let gate = Arc::new(Notify::new());
    let transport = GatedTransport {
        net: net.clone(),
        room: "SLOW",
        gate: gate.clone(),
    };
    let session = RelaySession::with_memory_store(RelayConfig::for_testing(), Arc::new(transport));
    session.join("SLOW", "u1").await.unwrap();
    session.join("FAST", "u1").await.unwrap();
    let mut slow_rx = listen(&session, "SLOW").await;
    let mut fast_rx = listen(&session, "FAST").await;

    let stalled = {
        let session = session.clone();
        tokio::spawn(async move {
            let env = envelope(MessageKind::Question, 1, "u1");
            session.send("SLOW", env, "u1", DeliveryCallbacks::new()).await
        })
    };
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }

    let fast = envelope(MessageKind::Answer, 2, "u2");
    net.redeliver("FAST", encode(&fast).unwrap());
    assert_eq!(next(&mut fast_rx).await, fast);
    assert_eq!(session.room_stats("FAST").await.unwrap().received, 1);
    assert!(!stalled.is_finished());

    gate.notify_one();
    timeout(WAIT, stalled).await.unwrap().unwrap().unwrap();
    assert_eq!(next(&mut slow_rx).await.timestamp, 1);
}
