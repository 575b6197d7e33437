//! Host graph facade
//!
//! The durability core does not own the vertex/arc model. It consumes a graph
//! through this narrow surface:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Graph                                         │
//! │  identity   id / name / dir / system flag     │
//! │  counts     order, size, properties, vectors  │
//! │  enums      vertex types, relationships       │
//! │  tx ledger  inbound + outbound TxCounters     │
//! │  locks      readonly gate, vertex tracking    │
//! │  collaborators (serialize yourself)           │
//! │  vprop log, emitter, snapshot coordinator     │
//! └──────────────────────────────────────────────┘
//! ```

pub mod collaborator;
pub mod lock;

pub use collaborator::{Collaborator, CollaboratorSet, SerialOrder};
pub use lock::{GraphLocks, ReadonlyGuard, SerializingGuard, ThreadLocks, VertexLockGuard};

use crate::durability::{
    DurabilityPoint, DurabilityTracker, MasterSerial, TxCounters, TxId, TxPoint, now_millis,
    now_secs,
};
use crate::error::IoResultExt;
use crate::replication::emitter::Emitter;
use crate::replication::protocol::{CommitGroup, Operation};
use crate::snapshot::{GraphState, SnapshotConfig, SnapshotCoordinator, SnapshotReport, paths};
use crate::vprop::VirtualPropertyLog;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum entries in each enumeration table
pub const MAX_ENUMERATED: usize = 256;

/// Bytes reserved for an enumeration name prefix
pub const PREFIX_BYTES: usize = 32;

/// 128-bit graph object id
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[u64; 2]", into = "[u64; 2]")]
pub struct GraphId(pub u128);

impl GraphId {
    /// Derive a stable id from a graph name
    pub fn from_name(name: &str) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(name.as_bytes()))
    }

    /// Low and high words
    pub fn words(&self) -> (u64, u64) {
        (self.0 as u64, (self.0 >> 64) as u64)
    }
}

impl From<[u64; 2]> for GraphId {
    fn from(w: [u64; 2]) -> Self {
        Self(w[0] as u128 | ((w[1] as u128) << 64))
    }
}

impl From<GraphId> for [u64; 2] {
    fn from(id: GraphId) -> Self {
        let (lo, hi) = id.words();
        [lo, hi]
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GraphId({})", self)
    }
}

/// Base counts of a graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    /// Number of vertices
    pub order: u64,
    /// Number of arcs
    pub size: u64,
    /// Number of properties
    pub properties: u64,
    /// Distinct property keys
    pub keys: u64,
    /// Distinct string values
    pub string_values: u64,
    /// Strings held by the property allocator
    pub strings: u64,
    /// Number of vectors
    pub vectors: u64,
    /// Vector dimensions
    pub dimensions: u64,
}

/// One vertex type enumeration entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexTypeEntry {
    /// Type name (truncated to the stored prefix length)
    pub name: String,
    /// Hash of the full type name
    pub hash: u64,
    /// Encoded type
    pub encoding: u8,
    /// Vertices of this type
    pub order: u64,
}

/// One relationship enumeration entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEntry {
    /// Relationship name (truncated to the stored prefix length)
    pub name: String,
    /// Hash of the full relationship name
    pub hash: u64,
    /// Encoded relationship
    pub encoding: u8,
    /// Arcs with this relationship, -1 when not yet counted
    pub size: i64,
}

/// Enumeration tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumerations {
    /// Vertex types
    pub vertex_types: Vec<VertexTypeEntry>,
    /// Relationships
    pub relationships: Vec<RelationshipEntry>,
}

/// Inbound and outbound transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxLedger {
    /// Consumed from an upstream provider
    pub inbound: TxCounters,
    /// Produced to downstream producers
    pub outbound: TxCounters,
}

/// Truncate `name` to fit in a NUL-terminated prefix slot
pub fn enum_prefix(name: &str) -> String {
    let mut end = name.len().min(PREFIX_BYTES - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Options for opening a graph
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Graph name
    pub name: String,
    /// Graph directory
    pub dir: PathBuf,
    /// Explicit id; derived from the name when absent
    pub id: Option<GraphId>,
    /// Never attached to the output stream
    pub local_only: bool,
    /// This is the system graph
    pub system: bool,
    /// Snapshot behaviour
    pub snapshot: SnapshotConfig,
}

impl GraphOptions {
    /// Options for a user graph
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            id: None,
            local_only: false,
            system: false,
            snapshot: SnapshotConfig::default(),
        }
    }

    /// Use an explicit id
    pub fn with_id(mut self, id: GraphId) -> Self {
        self.id = Some(id);
        self
    }

    /// Mark as local only
    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    /// Mark as the system graph
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Set snapshot configuration
    pub fn with_snapshot_config(mut self, config: SnapshotConfig) -> Self {
        self.snapshot = config;
        self
    }
}

/// Host graph as consumed by the durability core
pub struct Graph {
    id: GraphId,
    name: String,
    dir: PathBuf,
    system: bool,
    local_only: AtomicBool,
    inception: AtomicU64,
    started_ms: u64,
    started: Instant,
    counts: RwLock<GraphCounts>,
    enums: RwLock<Enumerations>,
    tx: Mutex<TxLedger>,
    opcount: AtomicU64,
    locks: GraphLocks,
    collaborators: RwLock<CollaboratorSet>,
    vprop: RwLock<Option<Arc<VirtualPropertyLog>>>,
    durability: DurabilityTracker,
    emitter: RwLock<Option<Arc<Emitter>>>,
    master: Arc<MasterSerial>,
    inbound_bound: AtomicBool,
    snapshot: SnapshotCoordinator,
}

impl Graph {
    /// Open a graph, creating its directory if needed
    pub fn open(options: GraphOptions, master: Arc<MasterSerial>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&options.dir).fs_context("create_dir", &options.dir)?;
        let id = options
            .id
            .unwrap_or_else(|| GraphId::from_name(&options.name));
        tracing::debug!("Opened graph '{}' ({}) at {}", options.name, id, options.dir.display());
        Ok(Arc::new(Self {
            id,
            name: options.name,
            dir: options.dir,
            system: options.system,
            local_only: AtomicBool::new(options.local_only),
            inception: AtomicU64::new(now_secs()),
            started_ms: now_millis(),
            started: Instant::now(),
            counts: RwLock::new(GraphCounts::default()),
            enums: RwLock::new(Enumerations::default()),
            tx: Mutex::new(TxLedger::default()),
            opcount: AtomicU64::new(0),
            locks: GraphLocks::new(),
            collaborators: RwLock::new(CollaboratorSet::new()),
            vprop: RwLock::new(None),
            durability: DurabilityTracker::new(),
            emitter: RwLock::new(None),
            master,
            inbound_bound: AtomicBool::new(false),
            snapshot: SnapshotCoordinator::new(options.snapshot),
        }))
    }

    /// Graph id
    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Graph directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True for the system graph
    pub fn is_system(&self) -> bool {
        self.system
    }

    /// True if never attached to the output stream
    pub fn is_local_only(&self) -> bool {
        self.local_only.load(Ordering::SeqCst)
    }

    /// Change the local-only flag
    pub fn set_local_only(&self, local_only: bool) {
        self.local_only.store(local_only, Ordering::SeqCst);
    }

    /// Inception time (Unix seconds)
    pub fn inception(&self) -> u64 {
        self.inception.load(Ordering::SeqCst)
    }

    /// Process start time for this graph instance (Unix millis)
    pub fn started_ms(&self) -> u64 {
        self.started_ms
    }

    /// Uptime of this graph instance
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Shared master serial
    pub fn master_serial(&self) -> &Arc<MasterSerial> {
        &self.master
    }

    /// Lock facade
    pub fn locks(&self) -> &GraphLocks {
        &self.locks
    }

    /// Snapshot coordinator owned by this graph
    pub fn snapshot(&self) -> &SnapshotCoordinator {
        &self.snapshot
    }

    /// Current base counts
    pub fn counts(&self) -> GraphCounts {
        *self.counts.read()
    }

    /// Replace the base counts
    pub fn set_counts(&self, counts: GraphCounts) {
        *self.counts.write() = counts;
    }

    /// Modify the base counts in place
    pub fn update_counts(&self, f: impl FnOnce(&mut GraphCounts)) {
        f(&mut *self.counts.write());
    }

    /// Current enumeration tables
    pub fn enumerations(&self) -> Enumerations {
        self.enums.read().clone()
    }

    /// Register a vertex type and return its encoding
    pub fn register_vertex_type(&self, name: &str) -> Result<u8> {
        let hash = xxhash_rust::xxh3::xxh3_64(name.as_bytes());
        let mut enums = self.enums.write();
        if let Some(existing) = enums.vertex_types.iter().find(|e| e.hash == hash) {
            return Ok(existing.encoding);
        }
        if enums.vertex_types.len() >= MAX_ENUMERATED {
            return Err(Error::state(format!(
                "Vertex type enumeration full ({} entries)",
                MAX_ENUMERATED
            )));
        }
        let encoding = enums.vertex_types.len() as u8;
        enums.vertex_types.push(VertexTypeEntry {
            name: enum_prefix(name),
            hash,
            encoding,
            order: 0,
        });
        Ok(encoding)
    }

    /// Set the vertex count of a registered type
    pub fn set_vertex_type_order(&self, encoding: u8, order: u64) {
        if let Some(entry) = self
            .enums
            .write()
            .vertex_types
            .iter_mut()
            .find(|e| e.encoding == encoding)
        {
            entry.order = order;
        }
    }

    /// Register a relationship and return its encoding
    pub fn register_relationship(&self, name: &str) -> Result<u8> {
        let hash = xxhash_rust::xxh3::xxh3_64(name.as_bytes());
        let mut enums = self.enums.write();
        if let Some(existing) = enums.relationships.iter().find(|e| e.hash == hash) {
            return Ok(existing.encoding);
        }
        if enums.relationships.len() >= MAX_ENUMERATED {
            return Err(Error::state(format!(
                "Relationship enumeration full ({} entries)",
                MAX_ENUMERATED
            )));
        }
        let encoding = enums.relationships.len() as u8;
        enums.relationships.push(RelationshipEntry {
            name: enum_prefix(name),
            hash,
            encoding,
            size: -1,
        });
        Ok(encoding)
    }

    /// Operations applied to this graph
    pub fn opcount(&self) -> u64 {
        self.opcount.load(Ordering::SeqCst)
    }

    /// Transaction counters
    pub fn tx_ledger(&self) -> TxLedger {
        *self.tx.lock()
    }

    /// Record a transaction consumed from an upstream provider
    pub fn record_inbound(&self, point: TxPoint) {
        self.tx.lock().inbound.record(point);
    }

    /// Register a collaborator
    pub fn add_collaborator(&self, order: SerialOrder, collaborator: Arc<dyn Collaborator>) {
        self.collaborators.write().insert(order, collaborator);
    }

    /// Registered collaborators
    pub fn collaborators(&self) -> CollaboratorSet {
        self.collaborators.read().clone()
    }

    /// Open (or create) the virtual property log for this graph
    pub fn open_virtual_properties(&self) -> Result<Arc<VirtualPropertyLog>> {
        if let Some(log) = self.vprop.read().as_ref() {
            return Ok(Arc::clone(log));
        }
        let path = paths::vprop_path(&self.dir, &self.name);
        let log = Arc::new(VirtualPropertyLog::open(&path, self.id)?);
        *self.vprop.write() = Some(Arc::clone(&log));
        Ok(log)
    }

    /// Virtual property log, if opened
    pub fn virtual_properties(&self) -> Option<Arc<VirtualPropertyLog>> {
        self.vprop.read().clone()
    }

    /// Durability tracker
    pub fn durability(&self) -> &DurabilityTracker {
        &self.durability
    }

    /// Last inbound transaction reflected in a completed snapshot
    pub fn durability_point(&self) -> DurabilityPoint {
        self.durability.point()
    }

    /// Operation emitter, if running
    pub fn emitter(&self) -> Option<Arc<Emitter>> {
        self.emitter
            .read()
            .as_ref()
            .filter(|e| e.is_running())
            .cloned()
    }

    pub(crate) fn set_emitter(&self, emitter: Option<Arc<Emitter>>) {
        *self.emitter.write() = emitter;
    }

    pub(crate) fn take_emitter(&self) -> Option<Arc<Emitter>> {
        self.emitter.write().take()
    }

    /// True when this graph's inbound listener is bound
    pub fn inbound_listener_bound(&self) -> bool {
        self.inbound_bound.load(Ordering::SeqCst)
    }

    pub(crate) fn set_inbound_listener_bound(&self, bound: bool) {
        self.inbound_bound.store(bound, Ordering::SeqCst);
    }

    /// Capture operations as one commit group on the outbound stream
    ///
    /// Returns `None` when no emitter is running; the operations are then
    /// local only.
    pub fn capture(&self, ops: Vec<Operation>) -> Result<Option<TxPoint>> {
        let Some(emitter) = self.emitter() else {
            return Ok(None);
        };
        // Serial assignment and enqueue happen under the ledger lock so the
        // queue order matches serial order.
        let mut tx = self.tx.lock();
        let point = TxPoint::new(TxId::random(), self.master.next());
        emitter.commit(CommitGroup {
            graph: self.id,
            tx: point,
            master_serial: self.master.current(),
            ops,
        })?;
        tx.outbound.record(point);
        Ok(Some(point))
    }

    /// Apply an opaque data mutation and capture it for replication
    pub fn record_mutation(&self, opcode: u32, payload: Vec<u8>) -> Result<Option<TxPoint>> {
        self.opcount.fetch_add(1, Ordering::SeqCst);
        self.capture(vec![Operation::Data { opcode, payload }])
    }

    /// Count an operation applied from an upstream provider
    pub(crate) fn count_operation(&self) {
        self.opcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot this graph
    pub fn persist(&self, budget: Duration, force: bool, remote: bool) -> Result<SnapshotReport> {
        self.snapshot.bulk_serialize(self, budget, force, remote)
    }

    /// Load the on-disk superblock, or synthesize one on first run
    pub fn load_state(&self) -> Result<GraphState> {
        crate::snapshot::load_state(self)
    }

    /// Restore state and collaborators from disk
    pub fn restore(&self) -> Result<u64> {
        self.snapshot.restore(self)
    }

    /// Adopt counts, enumerations and transaction counters from a superblock
    pub fn apply_state(&self, state: &GraphState) {
        *self.counts.write() = state.counts();
        {
            let mut enums = self.enums.write();
            enums.vertex_types = state.vertex_types.clone();
            enums.relationships = state.relationships.clone();
        }
        {
            let mut tx = self.tx.lock();
            tx.inbound = state.graph.tx_in;
            tx.outbound = state.graph.tx_out;
        }
        self.opcount.store(state.graph.opcount, Ordering::SeqCst);
        if state.time.graph_t0 > 0 {
            self.inception.store(state.time.graph_t0, Ordering::SeqCst);
        }
        self.set_local_only(state.graph.local_only);
        self.durability.mark(DurabilityPoint {
            tx: state.graph.tx_in.last,
            persisted_ts: state.time.persist_t1,
        });
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("system", &self.system)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    fn open(ctx: &TestContext, name: &str) -> Arc<Graph> {
        Graph::open(
            GraphOptions::new(name, ctx.path().join(name)),
            Arc::new(MasterSerial::from_clock()),
        )
        .unwrap()
    }

    #[test]
    fn test_open_creates_directory() {
        let ctx = TestContext::new();
        let g = open(&ctx, "people");
        assert!(g.dir().is_dir());
        assert_eq!(g.id(), GraphId::from_name("people"));
        assert!(!g.is_system());
    }

    #[test]
    fn test_enumeration_registration() {
        let ctx = TestContext::new();
        let g = open(&ctx, "g");
        let person = g.register_vertex_type("person").unwrap();
        let city = g.register_vertex_type("city").unwrap();
        assert_eq!(g.register_vertex_type("person").unwrap(), person);
        assert_ne!(person, city);
        let knows = g.register_relationship("knows").unwrap();
        assert_eq!(knows, 0);
        g.set_vertex_type_order(city, 12);
        let enums = g.enumerations();
        assert_eq!(enums.vertex_types.len(), 2);
        assert_eq!(enums.vertex_types[1].order, 12);
        assert_eq!(enums.relationships[0].size, -1);
    }

    #[test]
    fn test_enum_prefix_truncates_on_char_boundary() {
        let long = "é".repeat(40);
        let p = enum_prefix(&long);
        assert!(p.len() < PREFIX_BYTES);
        assert!(p.chars().all(|c| c == 'é'));
        assert_eq!(enum_prefix("short"), "short");
    }

    #[test]
    fn test_capture_without_emitter_is_local() {
        let ctx = TestContext::new();
        let g = open(&ctx, "g");
        assert!(g.record_mutation(1, vec![1, 2, 3]).unwrap().is_none());
        assert_eq!(g.opcount(), 1);
        assert_eq!(g.tx_ledger().outbound.count, 0);
    }

    #[test]
    fn test_graph_id_words() {
        let id = GraphId::from_name("x");
        let words: [u64; 2] = id.into();
        assert_eq!(GraphId::from(words), id);
    }
}
