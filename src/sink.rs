//! Async batched writer for request outcomes.
//!
//! Outcomes are enqueued into a bounded in-memory queue consumed by one
//! background writer that batches rows into the outcome store. In `sync`
//! mode writes happen inline and await durability. When the queue is full
//! the oldest pending *update* is shed (newest state for a row wins);
//! a newly arriving insert is never dropped. Sink failures never surface
//! to the request path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::config::{SinkConfig, WriteMode};
use crate::db::ConfigDb;
use crate::models::RequestOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    /// Re-write of a row already inserted in this process (same id).
    Update,
}

#[derive(Debug)]
struct Pending {
    kind: WriteKind,
    outcome: RequestOutcome,
}

pub struct UsageSink {
    db: ConfigDb,
    config: SinkConfig,
    queue: Mutex<VecDeque<Pending>>,
    notify: Notify,
    shed_count: AtomicU64,
    write_failures: AtomicU64,
}

impl UsageSink {
    /// Create the sink and start its background writer (async mode).
    pub fn spawn(db: ConfigDb, config: SinkConfig) -> Arc<Self> {
        let sink = Arc::new(Self::queue_only(db, config));
        if sink.config.write_mode == WriteMode::Async {
            let writer = sink.clone();
            tokio::spawn(async move {
                writer.writer_loop().await;
            });
        }
        sink
    }

    /// Sink without a running writer; used by tests and by `spawn`.
    pub fn queue_only(db: ConfigDb, config: SinkConfig) -> Self {
        Self {
            db,
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shed_count: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Record a new outcome row. Exactly one insert arrives per inbound
    /// request; this call never blocks on the writer and never drops the
    /// arriving row.
    pub async fn record(&self, outcome: RequestOutcome) {
        self.enqueue(WriteKind::Insert, outcome).await;
    }

    /// Re-write an already-recorded row (late usage data).
    pub async fn amend(&self, outcome: RequestOutcome) {
        self.enqueue(WriteKind::Update, outcome).await;
    }

    async fn enqueue(&self, kind: WriteKind, outcome: RequestOutcome) {
        if self.config.write_mode == WriteMode::Sync {
            if let Err(e) = self.db.insert_outcomes(&[outcome]).await {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Synchronous outcome write failed");
            }
            return;
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.config.max_pending {
            // Shed policy: for an update, drop this row's own oldest pending
            // entry first (coalesce); otherwise drop the oldest update of
            // any row. Inserts are never the shed victim.
            let victim = if kind == WriteKind::Update {
                queue
                    .iter()
                    .position(|p| p.kind == WriteKind::Update && p.outcome.id == outcome.id)
                    .or_else(|| queue.iter().position(|p| p.kind == WriteKind::Update))
            } else {
                queue.iter().position(|p| p.kind == WriteKind::Update)
            };
            match victim {
                Some(index) => {
                    queue.remove(index);
                    self.shed_count.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    // Queue full of inserts; keep them all and let the
                    // queue exceed its bound transiently rather than lose
                    // an outcome row.
                    tracing::warn!(
                        pending = queue.len(),
                        "Usage sink over capacity with no shedable updates"
                    );
                }
            }
        }
        queue.push_back(Pending { kind, outcome });
        let should_flush = queue.len() >= self.config.batch_size;
        drop(queue);
        if should_flush {
            self.notify.notify_one();
        }
    }

    async fn writer_loop(&self) {
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.notify.notified() => {}
            }
            self.flush().await;
        }
    }

    /// Drain and write up to `batch_size` rows per round until empty.
    pub async fn flush(&self) {
        loop {
            let batch: Vec<RequestOutcome> = {
                let mut queue = self.queue.lock().await;
                if queue.is_empty() {
                    return;
                }
                let take = queue.len().min(self.config.batch_size);
                queue.drain(..take).map(|p| p.outcome).collect()
            };
            if let Err(e) = self.db.insert_outcomes(&batch).await {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    rows = batch.len(),
                    error = %e,
                    "Outcome batch write failed, rows dropped"
                );
            }
        }
    }
}
