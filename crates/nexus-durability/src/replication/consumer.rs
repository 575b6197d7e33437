//! Inbound transaction listener
//!
//! Accepts provider connections, answers handshakes with subscriber info and
//! applies committed transactions to local graphs. Every applied transaction
//! is recorded on the addressed graph's inbound ledger, which is what the next
//! snapshot reports as its durability point.
//!
//! Each provider connection runs as its own task. Stopping the listener
//! signals every connection and waits for them to close, so nothing is
//! applied once [`ConsumerService::stop`] returns.

use super::config::ReplicationConfig;
use super::protocol::{CommitGroup, Operation, PROTOCOL_VERSION, ReplicationMessage};
use super::validator::TxValidator;
use crate::system::System;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Consumer statistics
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Provider connections accepted
    pub connections: u64,
    /// Transactions applied
    pub transactions: u64,
    /// Operations applied
    pub operations: u64,
    /// Transactions dropped as replays
    pub replayed: u64,
    /// Transactions for graphs that do not exist here
    pub unknown_graph: u64,
}

/// Inbound listener
pub struct ConsumerService {
    config: ReplicationConfig,
    validator: Arc<TxValidator>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    suspended: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    provider: Mutex<Option<String>>,
    stats: Mutex<ConsumerStats>,
}

impl ConsumerService {
    /// Create a stopped listener
    pub fn new(config: ReplicationConfig, validator: Arc<TxValidator>) -> Self {
        Self {
            config,
            validator,
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
            provider: Mutex::new(None),
            stats: Mutex::new(ConsumerStats::default()),
        }
    }

    /// Bind `addr` and serve in the background; returns the bound address
    pub async fn bind(self: &Arc<Self>, system: Weak<System>, addr: SocketAddr) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::state("Input server already running"));
        }
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::Io(e));
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        self.suspended.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        tracing::info!("Input server listening on {}", local);

        let service = Arc::clone(self);
        let task = tokio::spawn(async move { service.serve(listener, shutdown_rx, system).await });
        *self.task.lock() = Some(task);
        Ok(local)
    }

    async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
        system: Weak<System>,
    ) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.stats.lock().connections += 1;
                            let service = Arc::clone(&self);
                            let system = system.clone();
                            let shutdown = shutdown_rx.clone();
                            connections.spawn(async move {
                                service.handle_provider(stream, addr, system, shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("Input server shutting down");
                    break;
                }
            }
            while let Some(done) = connections.try_join_next() {
                if let Err(e) = done {
                    tracing::error!("Provider connection task failed: {}", e);
                }
            }
        }
        drop(listener);

        let open = connections.len();
        if open > 0 {
            tracing::debug!("Waiting for {} provider connection(s) to close", open);
            let drain = async {
                while let Some(done) = connections.join_next().await {
                    if let Err(e) = done {
                        tracing::error!("Provider connection task failed: {}", e);
                    }
                }
            };
            if tokio::time::timeout(self.config.lock_drain_timeout, drain)
                .await
                .is_err()
            {
                tracing::warn!("Provider connections did not close, aborting");
                connections.shutdown().await;
            }
        }
        *self.local_addr.lock() = None;
        self.running.store(false, Ordering::SeqCst);
    }

    async fn handle_provider(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        system: Weak<System>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Provider connected from {}", addr);
        loop {
            let read = tokio::select! {
                read = ReplicationMessage::read_from(&mut stream) => read,
                _ = shutdown.changed() => {
                    tracing::info!("Closing provider connection {}", addr);
                    return;
                }
            };
            let msg = match read {
                Ok(msg) => msg,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::info!("Provider {} disconnected", addr);
                    return;
                }
                Err(e) => {
                    tracing::error!("Failed to read from provider {}: {}", addr, e);
                    return;
                }
            };
            let Some(system) = system.upgrade() else {
                return;
            };
            match msg {
                ReplicationMessage::Hello {
                    origin,
                    master_serial,
                    protocol_version,
                } => {
                    if protocol_version != PROTOCOL_VERSION {
                        let error = ReplicationMessage::Error {
                            code: 1,
                            message: format!(
                                "Protocol version mismatch: expected {}, got {}",
                                PROTOCOL_VERSION, protocol_version
                            ),
                        };
                        let _ = error.write_to(&mut stream).await;
                        return;
                    }
                    system.master_serial().observe(master_serial);
                    *self.provider.lock() = Some(origin);
                    let info = ReplicationMessage::SubscriberInfo {
                        adminport: self.config.admin_port,
                        digest: system.digest(),
                        master_serial: system.master_serial().current(),
                    };
                    if let Err(e) = info.write_to(&mut stream).await {
                        tracing::error!("Failed to send subscriber info to {}: {}", addr, e);
                        return;
                    }
                }
                ReplicationMessage::Transaction(group) => {
                    let stopping = loop {
                        let stopping = *shutdown.borrow();
                        if stopping || !self.suspended.load(Ordering::SeqCst) {
                            break stopping;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    };
                    if stopping {
                        return;
                    }
                    self.apply(&system, group).await;
                }
                ReplicationMessage::Error { code, message } => {
                    tracing::warn!("Provider {} reported error {}: {}", addr, code, message);
                }
                other => {
                    tracing::warn!(
                        "Unexpected {:?} message from provider {}",
                        other.message_type(),
                        addr
                    );
                }
            }
        }
    }

    async fn apply(&self, system: &Arc<System>, group: CommitGroup) {
        if !self.validator.check(group.graph, group.tx.serial) {
            self.stats.lock().replayed += 1;
            return;
        }
        system.master_serial().observe(group.master_serial);

        let sys = system.system_graph();
        let graph = if group.graph == sys.id() {
            Some(Arc::clone(sys))
        } else {
            system.graph_by_id(group.graph)
        };
        let Some(graph) = graph else {
            self.stats.lock().unknown_graph += 1;
            tracing::warn!(
                "Dropped transaction {} for unknown graph {}",
                group.tx.id,
                group.graph
            );
            return;
        };

        let n_ops = group.ops.len() as u64;
        for op in group.ops {
            match op {
                Operation::Data { .. } => graph.count_operation(),
                Operation::State { counts } => graph.set_counts(counts),
                Operation::GraphCreated { graph: id, name, .. } => {
                    if system.graph_by_id(id).is_none() {
                        // Opening a graph reads its files and may wait for readonly
                        let system = Arc::clone(system);
                        let created = tokio::task::spawn_blocking(move || {
                            match system.create_graph_with_id(&name, id) {
                                Ok(_) => tracing::info!("Created replicated graph '{}'", name),
                                Err(e) => tracing::error!(
                                    "Failed to create replicated graph '{}': {}",
                                    name,
                                    e
                                ),
                            }
                        })
                        .await;
                        if let Err(e) = created {
                            tracing::error!("Replicated graph creation task failed: {}", e);
                        }
                    }
                }
                Operation::GraphDestroyed { graph: id, .. } => {
                    if let Some(g) = system.graph_by_id(id) {
                        if let Err(e) = system.destroy_graph(g.name(), false) {
                            tracing::error!("Failed to remove replicated graph '{}': {}", g.name(), e);
                        }
                    }
                }
                Operation::Attach { origin, .. } => {
                    tracing::info!("Attached to provider '{}'", origin);
                    *self.provider.lock() = Some(origin);
                }
                Operation::Detach { .. } => {
                    tracing::info!("Provider detached");
                    self.provider.lock().take();
                }
                Operation::Persist { durable, .. } => {
                    tracing::debug!(
                        "Provider persisted '{}' at serial {}",
                        graph.name(),
                        durable.serial
                    );
                }
                Operation::Modified => {}
            }
        }
        graph.record_inbound(group.tx);

        let mut stats = self.stats.lock();
        stats.transactions += 1;
        stats.operations += n_ops;
    }

    /// Stop accepting, close provider connections and wait for both
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Input server task failed: {}", e);
            }
        }
    }

    /// Signal the listener to close without waiting
    pub fn stop_nowait(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Hold inbound transactions until [`resume`](Self::resume)
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        tracing::info!("Input server suspended");
    }

    /// Resume applying inbound transactions
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        tracing::info!("Input server resumed");
    }

    /// True while bound
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True while bound and not suspended
    pub fn is_active(&self) -> bool {
        self.is_running() && !self.suspended.load(Ordering::SeqCst)
    }

    /// Bound address
    pub fn input_address(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Origin of the provider feeding this listener
    pub fn attached_input(&self) -> Option<String> {
        self.provider.lock().clone()
    }

    /// Statistics
    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().clone()
    }
}
