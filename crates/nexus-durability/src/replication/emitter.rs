//! Per-graph operation emitter
//!
//! Each graph with attached outputs runs one emitter task. Captured commit
//! groups are queued in capture order and handed to every connected producer
//! by the task:
//!
//! ```text
//! Graph::capture ──► queue ──► emitter task ──► ProducerRegistry::broadcast
//!        enqueued ┘                   └ handed
//! ```
//!
//! A fence waits until `handed` catches up with `enqueued`. A group counts as
//! handed even when a producer's write failed, so the fence also reports
//! whether any delivery failed while it waited.

use super::producer::ProducerRegistry;
use super::protocol::{CommitGroup, ReplicationMessage};
use crate::graph::GraphId;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Command {
    Group(CommitGroup),
    Stop,
}

/// Emitter statistics
#[derive(Debug, Clone, Default)]
pub struct EmitterStats {
    /// Commit groups queued
    pub enqueued: u64,
    /// Commit groups handed to the transport
    pub handed: u64,
    /// Frame deliveries across all producers
    pub delivered: u64,
    /// Frame writes that failed and dropped a producer
    pub failed: u64,
    /// Commit groups that could not be encoded
    pub dropped: u64,
}

/// Outcome of [`Emitter::fence`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fence {
    /// Everything queued was handed off
    Complete,
    /// The deadline passed first
    Expired,
    /// Everything was handed off, but at least one producer write failed
    Failed,
}

struct Shared {
    handed: AtomicU64,
    failed: AtomicU64,
    stats: Mutex<EmitterStats>,
    registry: Arc<ProducerRegistry>,
}

/// Queue and task streaming one graph's commit groups
pub struct Emitter {
    graph: GraphId,
    name: String,
    tx: mpsc::UnboundedSender<Command>,
    enqueued: AtomicU64,
    running: Arc<AtomicBool>,
    capacity: usize,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Emitter {
    /// Spawn an emitter task on `runtime`
    pub fn start(
        runtime: &Handle,
        graph: GraphId,
        name: &str,
        registry: Arc<ProducerRegistry>,
        capacity: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(Shared {
            handed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stats: Mutex::new(EmitterStats::default()),
            registry,
        });
        let handle = runtime.spawn(run(
            name.to_string(),
            rx,
            Arc::clone(&shared),
            Arc::clone(&running),
        ));
        tracing::info!("Started operation emitter for '{}'", name);
        Arc::new(Self {
            graph,
            name: name.to_string(),
            tx,
            enqueued: AtomicU64::new(0),
            running,
            capacity,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Graph this emitter serves
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    /// True while accepting commit groups
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue a commit group; returns its queue sequence number
    pub fn commit(&self, group: CommitGroup) -> Result<u64> {
        if !self.is_running() {
            return Err(Error::state(format!(
                "Operation emitter for '{}' is not running",
                self.name
            )));
        }
        if self.pending() >= self.capacity as u64 {
            return Err(Error::state(format!(
                "Operation queue full ({} pending) for '{}'",
                self.pending(),
                self.name
            )));
        }
        let seq = self.enqueued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(Command::Group(group)).is_err() {
            self.enqueued.fetch_sub(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::state(format!(
                "Operation emitter for '{}' has exited",
                self.name
            )));
        }
        self.shared.registry.note_enqueued();
        Ok(seq)
    }

    /// Commit groups queued but not yet handed to the transport
    pub fn pending(&self) -> u64 {
        self.enqueued
            .load(Ordering::SeqCst)
            .saturating_sub(self.shared.handed.load(Ordering::SeqCst))
    }

    /// Statistics
    pub fn stats(&self) -> EmitterStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.enqueued = self.enqueued.load(Ordering::SeqCst);
        stats.handed = self.shared.handed.load(Ordering::SeqCst);
        stats.failed = self.shared.failed.load(Ordering::SeqCst);
        stats
    }

    /// Producer writes that have failed so far
    pub fn failures(&self) -> u64 {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Wait until everything queued so far has been handed off
    pub async fn fence(&self, deadline: Instant) -> Fence {
        self.fence_since(self.failures(), deadline).await
    }

    /// Like [`fence`](Self::fence), reporting failures beyond `failed`
    pub async fn fence_since(&self, failed: u64, deadline: Instant) -> Fence {
        let target = self.enqueued.load(Ordering::SeqCst);
        loop {
            if self.shared.handed.load(Ordering::SeqCst) >= target {
                if self.shared.failed.load(Ordering::SeqCst) > failed {
                    tracing::debug!("Fence on '{}' saw failed deliveries", self.name);
                    return Fence::Failed;
                }
                return Fence::Complete;
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    "Fence on '{}' expired with {} pending",
                    self.name,
                    target.saturating_sub(self.shared.handed.load(Ordering::SeqCst))
                );
                return Fence::Expired;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting, drain the queue, and wait for the task
    ///
    /// The task is aborted if it does not finish within `timeout`. Returns the
    /// number of commit groups that were never handed off.
    pub async fn stop(&self, timeout: Duration) -> u64 {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Stop);
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                tracing::warn!("Operation emitter for '{}' did not drain, aborting", self.name);
                handle.abort();
            }
        }
        tracing::info!("Stopped operation emitter for '{}'", self.name);
        self.pending()
    }

    /// Stop accepting and let the task drain in the background
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Command::Stop);
            tracing::info!("Shutting down operation emitter for '{}'", self.name);
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("graph", &self.graph)
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn run(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Group(group) => {
                let serial = group.tx.serial;
                match ReplicationMessage::Transaction(group).encode() {
                    Ok(frame) => {
                        let outcome = shared.registry.broadcast(&frame).await;
                        if outcome.failed > 0 {
                            shared.failed.fetch_add(outcome.failed as u64, Ordering::SeqCst);
                        }
                        {
                            let mut stats = shared.stats.lock();
                            stats.delivered += outcome.delivered as u64;
                            stats.failed += outcome.failed as u64;
                        }
                        tracing::trace!(
                            graph = %name,
                            serial,
                            delivered = outcome.delivered,
                            failed = outcome.failed,
                            "Handed commit group"
                        );
                    }
                    Err(e) => {
                        shared.stats.lock().dropped += 1;
                        tracing::error!("Failed to encode commit group for '{}': {}", name, e);
                    }
                }
                shared.handed.fetch_add(1, Ordering::SeqCst);
            }
            Command::Stop => break,
        }
    }
    running.store(false, Ordering::SeqCst);
    tracing::debug!("Operation emitter task for '{}' exited", name);
}
