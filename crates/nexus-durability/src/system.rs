//! Process-wide system: the system graph, user graphs and replication
//!
//! ```text
//! System
//!  ├── MasterSerial (shared by every graph)
//!  ├── system graph  <root>/system
//!  ├── user graphs   <root>/<name>
//!  ├── ReplicationManager (producers, emitters)
//!  └── ConsumerService (inbound listener)
//! ```
//!
//! A process normally holds one `System` through [`init`] / [`get`] /
//! [`destroy`]. Tests can build independent instances with [`System::new`].

use crate::config::DurabilityConfig;
use crate::durability::MasterSerial;
use crate::graph::{Graph, GraphId, GraphOptions};
use crate::replication::{
    AttachMode, ConsumerService, Connector, Fence, OutputDescription, ReplicationManager,
    TcpConnector,
};
use crate::snapshot::{self, SnapshotReport};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Name of the system graph
pub const SYSTEM_GRAPH: &str = "system";

static SYSTEM: OnceLock<RwLock<Option<Arc<System>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<System>>> {
    SYSTEM.get_or_init(|| RwLock::new(None))
}

/// Create the process-wide system
pub fn init(root: impl AsRef<Path>, config: DurabilityConfig) -> Result<Arc<System>> {
    let mut slot = slot().write();
    if slot.is_some() {
        return Err(Error::state("System already initialized"));
    }
    let system = System::new(root, config)?;
    *slot = Some(Arc::clone(&system));
    Ok(system)
}

/// The process-wide system
pub fn get() -> Result<Arc<System>> {
    slot()
        .read()
        .clone()
        .ok_or_else(|| Error::state("System not initialized"))
}

/// Tear down the process-wide system
pub fn destroy() -> Option<Arc<System>> {
    let system = slot().write().take()?;
    system.shutdown_emitters();
    tracing::info!("System at {} destroyed", system.root().display());
    Some(system)
}

/// System graph, user graphs and replication
pub struct System {
    config: DurabilityConfig,
    root: PathBuf,
    master: Arc<MasterSerial>,
    graph: Arc<Graph>,
    graphs: RwLock<Vec<Arc<Graph>>>,
    replication: ReplicationManager,
    consumer: Arc<ConsumerService>,
}

impl System {
    /// Open a system rooted at `root` with TCP transports
    pub fn new(root: impl AsRef<Path>, config: DurabilityConfig) -> Result<Arc<Self>> {
        Self::with_connector(root, config, Arc::new(TcpConnector))
    }

    /// Open a system using `connector` for producer transports
    pub fn with_connector(
        root: impl AsRef<Path>,
        config: DurabilityConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(Error::config)?;
        let root = root.as_ref().to_path_buf();
        let master = Arc::new(MasterSerial::from_clock());

        let dir = root.join(SYSTEM_GRAPH);
        snapshot::recover_interrupted(&dir, SYSTEM_GRAPH)?;
        let graph = Graph::open(
            GraphOptions::new(SYSTEM_GRAPH, &dir)
                .system()
                .with_snapshot_config(config.snapshot.clone()),
            Arc::clone(&master),
        )?;
        graph.restore()?;

        let replication = ReplicationManager::new(config.replication.clone(), connector);
        let consumer = Arc::new(ConsumerService::new(
            config.replication.clone(),
            Arc::clone(replication.validator()),
        ));
        tracing::info!("System opened at {}", root.display());
        Ok(Arc::new(Self {
            config,
            root,
            master,
            graph,
            graphs: RwLock::new(Vec::new()),
            replication,
            consumer,
        }))
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configuration
    pub fn config(&self) -> &DurabilityConfig {
        &self.config
    }

    /// Shared master serial
    pub fn master_serial(&self) -> &Arc<MasterSerial> {
        &self.master
    }

    /// The system graph
    pub fn system_graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Replication manager
    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    /// Inbound listener
    pub fn consumer(&self) -> &Arc<ConsumerService> {
        &self.consumer
    }

    /// Create or reopen a user graph
    pub fn create_graph(&self, name: &str, local_only: bool) -> Result<Arc<Graph>> {
        self.open_graph(GraphOptions::new(name, self.root.join(name)).local_only(local_only))
    }

    /// Create a user graph with an explicit id
    pub fn create_graph_with_id(&self, name: &str, id: GraphId) -> Result<Arc<Graph>> {
        self.open_graph(GraphOptions::new(name, self.root.join(name)).with_id(id))
    }

    fn open_graph(&self, options: GraphOptions) -> Result<Arc<Graph>> {
        if options.name == SYSTEM_GRAPH || self.graph_by_name(&options.name).is_some() {
            return Err(Error::state(format!("Graph '{}' already exists", options.name)));
        }
        match snapshot::recover_interrupted(&options.dir, &options.name)? {
            snapshot::Recovery::Clean => {}
            other => tracing::warn!("Recovered graph '{}': {:?}", options.name, other),
        }
        let graph = Graph::open(
            options.with_snapshot_config(self.config.snapshot.clone()),
            Arc::clone(&self.master),
        )?;
        graph.restore()?;
        if let Err(e) = self.replication.capture_create_graph(self, &graph, None) {
            if let Some(emitter) = graph.take_emitter() {
                emitter.shutdown();
            }
            return Err(e);
        }
        self.graphs.write().push(Arc::clone(&graph));
        Ok(graph)
    }

    /// Remove a user graph, optionally deleting its files
    pub fn destroy_graph(&self, name: &str, remove_files: bool) -> Result<()> {
        let graph = {
            let mut graphs = self.graphs.write();
            let pos = graphs
                .iter()
                .position(|g| g.name() == name)
                .ok_or_else(|| Error::state(format!("Graph '{}' does not exist", name)))?;
            graphs.remove(pos)
        };
        self.replication.capture_destroy_graph(self, &graph)?;
        if let Some(emitter) = graph.take_emitter() {
            emitter.shutdown();
        }
        if remove_files {
            std::fs::remove_dir_all(graph.dir()).map_err(|e| Error::fs("remove_dir", graph.dir(), e))?;
        }
        tracing::info!("Destroyed graph '{}'", name);
        Ok(())
    }

    /// User graph by name
    pub fn graph_by_name(&self, name: &str) -> Option<Arc<Graph>> {
        self.graphs.read().iter().find(|g| g.name() == name).cloned()
    }

    /// User graph by id
    pub fn graph_by_id(&self, id: GraphId) -> Option<Arc<Graph>> {
        self.graphs.read().iter().find(|g| g.id() == id).cloned()
    }

    /// All user graphs
    pub fn graphs(&self) -> Vec<Arc<Graph>> {
        self.graphs.read().clone()
    }

    /// Attach downstream subscribers
    pub async fn attach_output<S: AsRef<str>>(
        &self,
        uris: &[S],
        mode: AttachMode,
        handshake: bool,
        timeout: Duration,
    ) -> Result<usize> {
        self.replication
            .attach_output(self, uris, mode, handshake, timeout)
            .await
    }

    /// Detach all subscribers, or those in `subset`
    pub async fn detach_output<S: AsRef<str>>(
        &self,
        subset: Option<&[S]>,
        remove_disconnected: bool,
        force: bool,
        timeout: Duration,
    ) -> Result<bool> {
        self.replication
            .detach_output(self, subset, remove_disconnected, force, timeout)
            .await
    }

    /// Wait until every running emitter has handed off its queue
    ///
    /// Fails if a subscriber dropped while its queue was being handed off.
    pub async fn fence(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        match self.replication.fence_all(self, deadline).await {
            Fence::Complete => Ok(()),
            Fence::Expired => Err(Error::timeout("Operation fence timeout")),
            Fence::Failed => Err(Error::topology(
                "Operation fence failed, a subscriber dropped during delivery",
            )),
        }
    }

    /// Reconnect dropped subscribers, resynchronizing those that missed frames
    pub async fn reconnect_outputs(&self, timeout: Duration) -> usize {
        self.replication.reconnect_outputs(self, timeout).await
    }

    /// Names of attached subscribers
    pub fn attached_outputs(&self) -> Vec<String> {
        self.replication.attached_outputs()
    }

    /// Structured descriptions of attached subscribers
    pub fn describe_outputs(&self) -> Vec<OutputDescription> {
        self.replication.describe_outputs()
    }

    /// Start the inbound listener on `addr`
    pub async fn bind_input(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let bound = self.consumer.bind(Arc::downgrade(self), addr).await?;
        self.graph.set_inbound_listener_bound(true);
        Ok(bound)
    }

    /// Stop the inbound listener
    pub async fn unbind_input(&self) {
        self.consumer.stop().await;
        self.graph.set_inbound_listener_bound(false);
    }

    /// Hold inbound transactions
    pub fn suspend_input(&self) {
        self.consumer.suspend();
    }

    /// Resume inbound transactions
    pub fn resume_input(&self) {
        self.consumer.resume();
    }

    /// Address of the inbound listener, if bound
    pub fn input_address(&self) -> Option<SocketAddr> {
        self.consumer.input_address()
    }

    /// True while the inbound listener is bound and not suspended
    pub fn consumer_active(&self) -> bool {
        self.consumer.is_active()
    }

    /// Digest of graph identities and their inbound positions
    pub fn digest(&self) -> String {
        let mut graphs = self.graphs();
        graphs.sort_by(|a, b| a.name().cmp(b.name()));
        let mut buf = Vec::with_capacity(graphs.len() * 40);
        for g in &graphs {
            buf.extend_from_slice(&g.id().0.to_le_bytes());
            buf.extend_from_slice(&g.opcount().to_le_bytes());
            buf.extend_from_slice(&g.tx_ledger().inbound.last.serial.to_le_bytes());
        }
        format!("{:032x}", xxhash_rust::xxh3::xxh3_128(&buf))
    }

    /// Snapshot every user graph, then the system graph when no listener runs
    pub fn persist_all(&self, budget: Duration, force: bool) -> Result<Vec<SnapshotReport>> {
        let mut reports = Vec::new();
        for graph in self.graphs() {
            reports.push(graph.persist(budget, force, true)?);
        }
        if !self.graph.inbound_listener_bound() {
            reports.push(self.graph.persist(budget, force, false)?);
        }
        Ok(reports)
    }

    fn shutdown_emitters(&self) {
        for graph in self.graphs() {
            if let Some(emitter) = graph.take_emitter() {
                emitter.shutdown();
            }
        }
        if let Some(emitter) = self.graph.take_emitter() {
            emitter.shutdown();
        }
        self.consumer.stop_nowait();
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("root", &self.root)
            .field("graphs", &self.graphs.read().len())
            .field("outputs", &self.attached_outputs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    #[test]
    fn test_create_and_destroy_graph() {
        let ctx = TestContext::new();
        let system = System::new(ctx.path(), DurabilityConfig::default()).unwrap();
        let g = system.create_graph("people", false).unwrap();
        assert!(g.dir().starts_with(ctx.path()));
        assert!(system.create_graph("people", false).is_err());
        assert!(system.graph_by_id(g.id()).is_some());
        system.destroy_graph("people", true).unwrap();
        assert!(system.graph_by_name("people").is_none());
        assert!(!ctx.path().join("people").exists());
    }

    #[test]
    fn test_digest_tracks_graphs() {
        let ctx = TestContext::new();
        let system = System::new(ctx.path(), DurabilityConfig::default()).unwrap();
        let empty = system.digest();
        let g = system.create_graph("g", false).unwrap();
        let one = system.digest();
        assert_ne!(empty, one);
        g.record_mutation(1, vec![]).unwrap();
        assert_ne!(one, system.digest());
    }

    #[test]
    fn test_failed_creation_capture_leaves_graph_unregistered() {
        let ctx = TestContext::new();
        let system = System::new(ctx.path(), DurabilityConfig::default()).unwrap();
        let readonly = system
            .system_graph()
            .locks()
            .acquire_readonly(SYSTEM_GRAPH, Duration::from_secs(1))
            .unwrap();

        let err = system.create_graph("g", false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::State);
        assert!(system.graph_by_name("g").is_none());
        assert!(system.graphs().is_empty());

        // Local-only graphs emit nothing and are unaffected
        system.create_graph("scratch", true).unwrap();

        drop(readonly);
        let g = system.create_graph("g", false).unwrap();
        assert!(system.graph_by_id(g.id()).is_some());
    }

    #[test]
    fn test_persist_all_reopens() {
        let ctx = TestContext::new();
        {
            let system = System::new(ctx.path(), DurabilityConfig::default()).unwrap();
            let g = system.create_graph("g", false).unwrap();
            g.update_counts(|c| c.order = 11);
            let reports = system.persist_all(Duration::from_secs(1), false).unwrap();
            assert_eq!(reports.len(), 2);
        }
        let system = System::new(ctx.path(), DurabilityConfig::default()).unwrap();
        let g = system.create_graph("g", false).unwrap();
        assert_eq!(g.counts().order, 11);
    }
}
