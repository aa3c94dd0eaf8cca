//! Write-behind persistence.
//!
//! ```text
//! mark_dirty(k1,a) mark_dirty(k2,b) mark_dirty(k1,a) flush()
//!      │                │                │          │
//!      ▼                ▼                ▼          ▼
//!  ┌──────────── queue (unbounded, never blocks) ───────────┐
//!  └──────────────────────────┬─────────────────────────────┘
//!                             ▼
//!          batch: { k1: a, k2: b }   (latest source per key wins)
//!                             ▼
//!   spawn_blocking → snapshot() once per key → store.set()
//!                             ▼
//!                  flush waiters released
//! ```
//!
//! Values are rendered when the batch commits, so a burst of marks for one
//! key costs a single serialization. A write still queued when the process
//! dies is lost. Failures are logged and
//! counted, never returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};

use super::KeyValueStore;

/// State that can render its own persisted form on demand.
pub trait Snapshot: Send + Sync {
    fn snapshot(&self) -> String;
}

enum Command {
    Write { key: String, source: Arc<dyn Snapshot> },
    Flush(oneshot::Sender<()>),
}

/// Persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    /// Writes handed to the persister
    pub requested: u64,
    /// Writes that reached the store
    pub committed: u64,
    /// Writes replaced by a newer value for the same key before commit
    pub coalesced: u64,
    /// Writes the store rejected
    pub failed: u64,
}

#[derive(Default)]
struct AtomicPersistStats {
    requested: AtomicU64,
    committed: AtomicU64,
    coalesced: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the background writer. Clones share the same writer.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<AtomicPersistStats>,
}

impl Persister {
    /// Start the writer task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicPersistStats::default());
        tokio::spawn(run(store, rx, stats.clone()));
        Self { tx, stats }
    }

    /// Queue a write of `source` under `key`. Returns immediately.
    pub fn mark_dirty(&self, key: impl Into<String>, source: Arc<dyn Snapshot>) {
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        let cmd = Command::Write {
            key: key.into(),
            source,
        };
        if self.tx.send(cmd).is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("Persister is closed; dropping write");
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            requested: self.stats.requested.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    store: Arc<dyn KeyValueStore>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<AtomicPersistStats>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch: IndexMap<String, Arc<dyn Snapshot>> = IndexMap::new();
        let mut waiters = Vec::new();

        let mut absorb = |cmd: Command| match cmd {
            Command::Write { key, source } => {
                if batch.insert(key, source).is_some() {
                    stats.coalesced.fetch_add(1, Ordering::Relaxed);
                }
            }
            Command::Flush(done) => waiters.push(done),
        };
        absorb(first);
        while let Ok(cmd) = rx.try_recv() {
            absorb(cmd);
        }

        if !batch.is_empty() {
            let store = store.clone();
            let stats_w = stats.clone();
            let written = tokio::task::spawn_blocking(move || write_batch(store.as_ref(), batch, &stats_w)).await;
            if let Err(e) = written {
                log::error!("Persist batch task failed: {e}");
            }
        }

        for done in waiters {
            let _ = done.send(());
        }
    }
    log::debug!("Persister stopped");
}

fn write_batch(
    store: &dyn KeyValueStore,
    batch: IndexMap<String, Arc<dyn Snapshot>>,
    stats: &AtomicPersistStats,
) {
    let count = batch.len();
    for (key, source) in batch {
        match store.set(&key, &source.snapshot()) {
            Ok(()) => {
                stats.committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to persist {key}: {e}");
            }
        }
    }
    log::trace!("Persisted batch of {count} keys");
}
