//! Output topology: attaching and detaching downstream subscribers
//!
//! Attach validates the whole batch before touching state, then brings each
//! producer up one at a time:
//!
//! ```text
//! parse URIs → reject self → validate unregistered → for each:
//!     connect (+handshake) → register → Attach/Modified on SYSTEM
//!     → replay GraphCreated + State for every user graph
//! → fence all emitters → drop producers that failed during the fence
//! ```
//!
//! Detach fences, stops every emitter, says goodbye on the system stream,
//! clears the registry and, for a subset detach, re-attaches the rest.
//! A subset detach is therefore not atomic.

use super::config::ReplicationConfig;
use super::emitter::{Emitter, Fence};
use super::producer::{AttachMode, Handshake, OutputDescription, Producer, ProducerRegistry};
use super::protocol::Operation;
use super::transport::Connector;
use super::uri::Uri;
use super::validator::TxValidator;
use crate::graph::Graph;
use crate::system::System;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Readonly budget for capturing a consistent `State` record
const STATE_READONLY_BUDGET: Duration = Duration::from_secs(10);

/// Owns the producer registry and the attach/detach protocol
pub struct ReplicationManager {
    config: ReplicationConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<ProducerRegistry>,
    validator: Arc<TxValidator>,
    state_change: tokio::sync::Mutex<()>,
    origin: String,
}

impl ReplicationManager {
    /// Create a manager using `connector` for producer transports
    pub fn new(config: ReplicationConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            registry: Arc::new(ProducerRegistry::new()),
            validator: Arc::new(TxValidator::new()),
            state_change: tokio::sync::Mutex::new(()),
            origin: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Producer registry
    pub fn registry(&self) -> &Arc<ProducerRegistry> {
        &self.registry
    }

    /// Inbound anti-replay validator
    pub fn validator(&self) -> &Arc<TxValidator> {
        &self.validator
    }

    /// Origin identifier sent in handshakes and attach records
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Attach producers for `uris`
    ///
    /// Returns the number of producers attached. `timeout` is raised to at
    /// least 5 s and bounds the whole call including the final fence.
    pub async fn attach_output<S: AsRef<str>>(
        &self,
        system: &System,
        uris: &[S],
        mode: AttachMode,
        handshake: bool,
        timeout: Duration,
    ) -> Result<usize> {
        let timeout = self.config.effective_attach_timeout(timeout);
        let deadline = Instant::now() + timeout;
        let _guard = self.state_change.lock().await;

        let parsed = uris
            .iter()
            .map(|s| Uri::parse(s.as_ref(), &self.config.default_scheme))
            .collect::<Result<Vec<_>>>()?;

        if let Some(own) = system.input_address() {
            for uri in &parsed {
                let addrs = self.connector.resolve(uri).await?;
                if addrs.iter().any(|a| is_own_address(*a, own)) {
                    return Err(Error::topology(format!("Cannot attach to self: {}", uri)));
                }
            }
        }

        // Connect to every new destination once before changing any state
        for uri in parsed.iter().filter(|u| !self.registry.contains(&u.to_string())) {
            let budget = remaining(deadline).min(self.config.connect_timeout);
            match self.connector.connect(uri, budget).await {
                Ok(check) => drop(check),
                Err(e) => {
                    tracing::warn!("Subscriber {} failed validation: {}", uri, e);
                    return Err(e);
                }
            }
        }

        let mut attached = Vec::new();
        for uri in parsed {
            let hs = handshake.then(|| Handshake {
                origin: self.origin.clone(),
                master_serial: system.master_serial().current(),
            });
            let producer =
                Producer::connect(uri, mode, self.connector.as_ref(), &self.config, hs).await?;
            if let Err(e) = self.registry.add(Arc::clone(&producer)) {
                producer.abandon();
                return Err(e);
            }
            if let Err(e) = self.announce(system, &producer).await {
                tracing::error!("Failed to attach {}: {}", producer.name(), e);
                self.registry.remove(producer.name());
                producer.abandon();
                return Err(e);
            }
            tracing::info!("Attached subscriber {}", producer.name());
            attached.push(producer);
        }

        let fence = self.fence_all(system, deadline).await;

        // A write that timed out during the fence still counts as handed off
        let dropped: Vec<Arc<Producer>> = attached
            .iter()
            .filter(|p| !p.is_connected())
            .cloned()
            .collect();
        if !dropped.is_empty() {
            for producer in &dropped {
                self.registry.remove(producer.name());
                producer.abandon();
            }
            let names: Vec<&str> = dropped.iter().map(|p| p.name()).collect();
            tracing::error!("Subscriber(s) dropped while attaching: {}", names.join(", "));
            return Err(Error::topology(format!(
                "Transactional producer unexpectedly detached: {}",
                names.join(", ")
            )));
        }
        match fence {
            Fence::Complete => {}
            Fence::Expired => {
                return Err(Error::timeout(
                    "Operation fence timeout, cannot attach at this time",
                ));
            }
            Fence::Failed => {
                tracing::warn!("Delivery to a previously attached subscriber failed during attach");
            }
        }
        Ok(attached.len())
    }

    async fn announce(&self, system: &System, producer: &Producer) -> Result<()> {
        let sys = system.system_graph();
        self.ensure_emitter(sys)?;
        sys.capture(vec![
            Operation::Attach {
                master_serial: system.master_serial().current(),
                origin: self.origin.clone(),
            },
            Operation::Modified,
        ])?;
        if !producer.is_connected() {
            return Err(Error::topology(format!(
                "Transactional producer unexpectedly detached: {}",
                producer.name()
            )));
        }
        for graph in system.graphs() {
            self.capture_create_graph_async(system, &graph, Some(producer.name()))
                .await?;
            if !producer.is_connected() {
                return Err(Error::topology(format!(
                    "Transactional producer unexpectedly detached: {}",
                    producer.name()
                )));
            }
        }
        Ok(())
    }

    /// Emit `GraphCreated` for `graph` on the system stream
    ///
    /// When a connected producer exists the graph's own emitter is started and
    /// its base counts are captured as a `State` record. Blocks the calling
    /// thread while waiting for readonly; async callers use
    /// [`capture_create_graph_async`](Self::capture_create_graph_async).
    pub fn capture_create_graph(
        &self,
        system: &System,
        graph: &Graph,
        target: Option<&str>,
    ) -> Result<()> {
        if self.capture_graph_created(system, graph, target)? {
            let _readonly = graph
                .locks()
                .acquire_readonly(graph.name(), STATE_READONLY_BUDGET)?;
            graph.capture(vec![Operation::State {
                counts: graph.counts(),
            }])?;
        }
        Ok(())
    }

    /// [`capture_create_graph`](Self::capture_create_graph) without blocking a runtime worker
    pub async fn capture_create_graph_async(
        &self,
        system: &System,
        graph: &Graph,
        target: Option<&str>,
    ) -> Result<()> {
        if self.capture_graph_created(system, graph, target)? {
            let _readonly = graph
                .locks()
                .acquire_readonly_async(graph.name(), STATE_READONLY_BUDGET)
                .await?;
            graph.capture(vec![Operation::State {
                counts: graph.counts(),
            }])?;
        }
        Ok(())
    }

    /// Returns true when a `State` record must follow
    fn capture_graph_created(
        &self,
        system: &System,
        graph: &Graph,
        target: Option<&str>,
    ) -> Result<bool> {
        if graph.is_local_only() {
            return Ok(false);
        }
        let sys = system.system_graph();
        if sys.locks().is_readonly() {
            return Err(Error::state(format!(
                "System graph is readonly, cannot capture creation of '{}'",
                graph.name()
            )));
        }
        if sys.emitter().is_none() {
            return Ok(false);
        }
        if let Some(target) = target {
            if !self.registry.contains(target) {
                return Err(Error::topology(format!(
                    "Transactional producer '{}' is not registered",
                    target
                )));
            }
        }
        sys.capture(vec![Operation::GraphCreated {
            graph: graph.id(),
            name: graph.name().to_string(),
            path: graph.dir().display().to_string(),
            inception: graph.inception(),
            opid: graph.opcount(),
        }])?;

        if !self.registry.has_connected() {
            return Ok(false);
        }
        self.ensure_emitter(graph)?;
        Ok(true)
    }

    /// Emit `GraphDestroyed` for `graph` on the system stream
    pub fn capture_destroy_graph(&self, system: &System, graph: &Graph) -> Result<()> {
        if graph.is_local_only() {
            return Ok(());
        }
        let sys = system.system_graph();
        if sys.locks().is_readonly() {
            return Err(Error::state(format!(
                "System graph is readonly, cannot capture removal of '{}'",
                graph.name()
            )));
        }
        if sys.emitter().is_none() {
            return Ok(());
        }
        sys.capture(vec![Operation::GraphDestroyed {
            graph: graph.id(),
            path: graph.dir().display().to_string(),
        }])?;
        Ok(())
    }

    /// Start `graph`'s emitter unless it already runs
    pub fn ensure_emitter(&self, graph: &Graph) -> Result<Arc<Emitter>> {
        if let Some(emitter) = graph.emitter() {
            return Ok(emitter);
        }
        let runtime = Handle::try_current().map_err(|_| {
            Error::state(format!(
                "Cannot start operation emitter for '{}' outside an async runtime",
                graph.name()
            ))
        })?;
        let emitter = Emitter::start(
            &runtime,
            graph.id(),
            graph.name(),
            Arc::clone(&self.registry),
            self.config.emitter_queue_capacity,
        );
        graph.set_emitter(Some(Arc::clone(&emitter)));
        Ok(emitter)
    }

    /// Wait until every running emitter has handed off what it has queued
    ///
    /// Reports [`Fence::Failed`] if any emitter saw a failed delivery.
    pub async fn fence_all(&self, system: &System, deadline: Instant) -> Fence {
        let mut emitters: Vec<Arc<Emitter>> = system
            .graphs()
            .iter()
            .filter_map(|g| g.emitter())
            .collect();
        if let Some(e) = system.system_graph().emitter() {
            emitters.push(e);
        }
        let baselines: Vec<u64> = emitters.iter().map(|e| e.failures()).collect();
        let mut outcome = Fence::Complete;
        for (emitter, failed) in emitters.iter().zip(baselines) {
            match emitter.fence_since(failed, deadline).await {
                Fence::Complete => {}
                Fence::Expired => return Fence::Expired,
                Fence::Failed => outcome = Fence::Failed,
            }
        }
        outcome
    }

    /// Detach all producers, or those in `subset`
    ///
    /// Returns `Ok(false)` without changes while the inbound listener is
    /// active. A subset detach stops everything and re-attaches the retained
    /// producers in normal mode without handshake.
    pub async fn detach_output<S: AsRef<str>>(
        &self,
        system: &System,
        subset: Option<&[S]>,
        remove_disconnected: bool,
        force: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let timeout = self.config.effective_attach_timeout(timeout);
        let deadline = Instant::now() + timeout;
        let guard = self.state_change.lock().await;

        let listing = self.registry.list();
        let selected: Option<Vec<String>> = match subset {
            Some(names) => Some(
                names
                    .iter()
                    .map(|s| Uri::parse(s.as_ref(), &self.config.default_scheme).map(|u| u.to_string()))
                    .collect::<Result<_>>()?,
            ),
            None => None,
        };
        let matches = |p: &Producer| match &selected {
            Some(names) => names.iter().any(|n| n == p.name()),
            None => true,
        };

        for producer in listing.iter().filter(|p| matches(p)) {
            if force && producer.is_connected() {
                producer.abandon();
            }
            if remove_disconnected && !producer.is_connected() {
                producer.set_defunct();
            }
        }

        if system.consumer_active() {
            tracing::warn!("Emitter state will remain unchanged while input server is running");
            return Ok(false);
        }

        match self.fence_all(system, deadline).await {
            Fence::Complete => {}
            Fence::Expired => {
                return Err(Error::timeout(
                    "Operation fence timeout, cannot detach at this time",
                ));
            }
            Fence::Failed => tracing::warn!("Delivery to a subscriber failed while fencing detach"),
        }

        for graph in system.graphs() {
            let own = graph.locks().thread_locks().writable;
            if own > 0 {
                return Err(Error::state(format!(
                    "Cannot detach while current thread holds {} writable vertex locks in graph '{}'",
                    own,
                    graph.name()
                )));
            }
            self.drain_writable(&graph).await?;
            if let Some(emitter) = graph.take_emitter() {
                emitter.stop(remaining(deadline)).await;
            }
        }

        let sys = system.system_graph();
        if sys.emitter().is_some() {
            if let Err(e) = sys.capture(vec![Operation::Detach {
                master_serial: system.master_serial().current(),
            }]) {
                tracing::warn!("Failed to capture detach record: {}", e);
            }
        }
        let unconfirmed = match sys.take_emitter() {
            Some(emitter) => emitter.stop(remaining(deadline)).await,
            None => 0,
        };
        if unconfirmed > 0 {
            tracing::warn!(
                "Will detach with {} unconfirmed transactions pending",
                unconfirmed
            );
        }

        let removed = self.registry.clear();
        for producer in &removed {
            producer.abandon();
        }
        self.validator.reset();
        tracing::info!("Detached {} subscriber(s)", removed.len());
        drop(guard);

        if selected.is_some() {
            let retained: Vec<String> = listing
                .iter()
                .filter(|p| !matches(p) && !p.is_defunct())
                .map(|p| p.name().to_string())
                .collect();
            if !retained.is_empty() {
                self.attach_output(
                    system,
                    &retained,
                    AttachMode::Normal,
                    false,
                    remaining(deadline),
                )
                .await
                .map_err(|e| {
                    tracing::error!("Re-attach after subset detach failed: {}", e);
                    Error::topology(format!(
                        "Failed to re-attach subscribers subset after detach: {}",
                        e
                    ))
                })?;
            }
        }
        Ok(true)
    }

    async fn drain_writable(&self, graph: &Graph) -> Result<()> {
        let deadline = Instant::now() + self.config.lock_drain_timeout;
        loop {
            let held = graph.locks().writable_count();
            if held == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "Cannot detach graph '{}', writable vertex locks not released (WL vertices: {})",
                    graph.name(),
                    held
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Reconnect producers whose transport dropped; returns how many recovered
    ///
    /// A producer that missed frames while down is announced again, which
    /// replays every graph to it in synchronizing mode.
    pub async fn reconnect_outputs(&self, system: &System, timeout: Duration) -> usize {
        let _guard = self.state_change.lock().await;
        let mut recovered = 0;
        for producer in self.registry.list() {
            if producer.is_connected() || producer.is_retired() {
                continue;
            }
            match producer.reconnect(self.connector.as_ref(), timeout).await {
                Ok(false) => recovered += 1,
                Ok(true) => match self.announce(system, &producer).await {
                    Ok(()) => {
                        producer.resynchronized();
                        recovered += 1;
                    }
                    Err(e) => {
                        tracing::error!("Failed to resynchronize {}: {}", producer.name(), e);
                    }
                },
                Err(e) => tracing::debug!("Reconnect to {} failed: {}", producer.name(), e),
            }
        }
        recovered
    }

    /// Names of attached producers
    pub fn attached_outputs(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Structured descriptions of attached producers
    pub fn describe_outputs(&self) -> Vec<OutputDescription> {
        self.registry.list().iter().map(|p| p.describe()).collect()
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// True if `addr` reaches the listener bound at `own`
fn is_own_address(addr: SocketAddr, own: SocketAddr) -> bool {
    if addr.port() != own.port() {
        return false;
    }
    addr.ip() == own.ip()
        || (own.ip().is_unspecified() && (addr.ip().is_loopback() || addr.ip().is_unspecified()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_address() {
        let own: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        assert!(is_own_address("127.0.0.1:9000".parse().unwrap(), own));
        assert!(!is_own_address("127.0.0.1:9001".parse().unwrap(), own));
        assert!(!is_own_address("10.1.2.3:9000".parse().unwrap(), "127.0.0.1:9000".parse().unwrap()));
        assert!(is_own_address("10.1.2.3:9000".parse().unwrap(), "10.1.2.3:9000".parse().unwrap()));
    }
}
