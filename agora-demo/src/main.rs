//! Two sessions talking in one room over the loopback transport.
//!
//! Set `AGORA_STORE_PATH` to keep dedup history in RocksDB between runs;
//! otherwise it lives in memory. `RUST_LOG` controls verbosity (default
//! `info`).

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use agora_core::{encode, Envelope, MessageKind};
use agora_relay::storage::KeyValueStore;
use agora_relay::{
    DeliveryCallbacks, LoopbackNetwork, MemoryStore, RelayConfig, RelaySession, RocksStore,
    StoreConfig,
};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const ROOM: &str = "lobby";

#[derive(Debug, Serialize, Deserialize)]
struct Question {
    title: String,
}

fn open_rocks() -> Result<Option<Arc<RocksStore>>, Box<dyn Error>> {
    let Some(path) = std::env::var_os("AGORA_STORE_PATH") else {
        return Ok(None);
    };
    let store = RocksStore::open(StoreConfig {
        path: path.into(),
        ..StoreConfig::default()
    })?;
    info!("Dedup history at {}", store.path().display());
    Ok(Some(Arc::new(store)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Agora demo...");

    let rocks = open_rocks()?;
    let alice_store: Arc<dyn KeyValueStore> = match &rocks {
        Some(store) => store.clone(),
        None => Arc::new(MemoryStore::new()),
    };

    let net = LoopbackNetwork::default();
    let alice = RelaySession::new(RelayConfig::default(), Arc::new(net.clone()), alice_store);
    let bob = RelaySession::with_memory_store(RelayConfig::default(), Arc::new(net.clone()));

    let mut observed = alice.observability().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = observed.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!("[observe] {line}"),
                Err(e) => log::warn!("Could not render event: {e}"),
            }
        }
    });

    alice.on_health_change(|healthy| info!("alice connectivity: {healthy}"));
    alice.join(ROOM, "alice").await?;
    bob.join(ROOM, "bob").await?;

    let (tx, mut inbox) = mpsc::unbounded_channel();
    bob.on_message(ROOM, move |env| {
        let _ = tx.send(env.clone());
    })
    .await?;

    let question = Envelope::json(
        MessageKind::Question,
        agora_core::now_millis(),
        "alice",
        &Question {
            title: "Is this thing on?".to_string(),
        },
    )?;
    let handle = alice
        .send(
            ROOM,
            question.clone(),
            "alice",
            DeliveryCallbacks::new()
                .on_sent(|h| info!("{h} sent"))
                .on_acknowledged(|h| info!("{h} acknowledged"))
                .on_error(|h, e| log::warn!("{h} failed: {e}")),
        )
        .await?;
    info!("alice sent {} as {handle}", question.kind);

    // Network-level redelivery; bob must see it once.
    net.redeliver(ROOM, encode(&question)?);

    if let Ok(Some(env)) = tokio::time::timeout(Duration::from_secs(1), inbox.recv()).await {
        let q: Question = env.payload_as()?;
        info!("bob received {:?} from {}", q.title, env.sender_id);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(env) = inbox.try_recv() {
        log::warn!("unexpected second delivery: {env:?}");
    }

    if let Some(stats) = bob.room_stats(ROOM).await {
        info!("bob stats: {}", serde_json::to_string(&stats)?);
    }

    bob.shutdown().await;
    alice.shutdown().await;
    if let Some(store) = &rocks {
        store.flush()?;
    }
    printer.abort();
    info!("Done");
    Ok(())
}
