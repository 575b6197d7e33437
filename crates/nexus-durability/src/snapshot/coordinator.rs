//! Snapshot coordinator
//!
//! ```text
//! Idle ──► AcquiringReadonly ──► Serializing ──► Releasing ──► Committed
//!  │             │                                        ├──► RolledBack
//!  │             │                                        └──► Failed
//!  └─ bad state ─┴── timeout ─────────────────────────────────► Idle
//! ```
//!
//! A forced snapshot first renames the graph directory aside. The new
//! directory is written from scratch, then the virtual property log is moved
//! home and only there committed to its new watermark, and finally the aside
//! is deleted. Any failure in between deletes the new directory and renames
//! the aside back.

use super::config::SnapshotConfig;
use super::paths;
use super::report;
use super::state::GraphState;
use crate::durability::{DurabilityPoint, TxPoint, now_millis};
use crate::error::IoResultExt;
use crate::graph::Graph;
use crate::replication::protocol::Operation;
use crate::vprop::VirtualPropertyLog;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    /// No snapshot running
    Idle,
    /// Waiting for writable vertex locks to drain
    AcquiringReadonly,
    /// Collaborators and superblock being written
    Serializing,
    /// Readonly and serializing flag being released
    Releasing,
    /// Last snapshot completed
    Committed,
    /// Last snapshot failed and was rolled back
    RolledBack,
    /// Last snapshot failed with nothing to roll back
    Failed,
}

/// Snapshot statistics
#[derive(Debug, Clone, Default)]
pub struct SnapshotStats {
    /// Completed snapshots
    pub completed: u64,
    /// Completed forced snapshots
    pub forced: u64,
    /// Failed snapshots
    pub failed: u64,
    /// Rollbacks that restored an aside directory
    pub rollbacks: u64,
    /// Duration of the last completed snapshot
    pub last_duration: Duration,
    /// Words written by the last completed snapshot
    pub last_words: u64,
}

/// Outcome of a completed snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReport {
    /// Words written by collaborators and the superblock
    pub words_written: u64,
    /// Wall time
    pub duration: Duration,
    /// Superblock as written
    pub state: GraphState,
    /// Directory was rewritten from scratch
    pub forced: bool,
    /// Persist/State control records emitted downstream
    pub emitted: Option<TxPoint>,
}

/// Per-graph snapshot coordinator
pub struct SnapshotCoordinator {
    config: SnapshotConfig,
    phase: Mutex<SnapshotPhase>,
    stats: Mutex<SnapshotStats>,
}

impl SnapshotCoordinator {
    /// Create a coordinator
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            phase: Mutex::new(SnapshotPhase::Idle),
            stats: Mutex::new(SnapshotStats::default()),
        }
    }

    /// Configuration
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Current phase
    pub fn phase(&self) -> SnapshotPhase {
        *self.phase.lock()
    }

    /// Statistics
    pub fn stats(&self) -> SnapshotStats {
        self.stats.lock().clone()
    }

    fn set_phase(&self, graph: &Graph, phase: SnapshotPhase) {
        *self.phase.lock() = phase;
        tracing::debug!(graph = graph.name(), ?phase, "snapshot phase");
    }

    /// Write a crash-consistent snapshot of `graph`
    ///
    /// A zero `budget` uses the configured readonly timeout.
    pub fn bulk_serialize(
        &self,
        graph: &Graph,
        budget: Duration,
        force: bool,
        remote: bool,
    ) -> Result<SnapshotReport> {
        let started = Instant::now();
        let _in_flight = graph.durability().begin();
        let serializing = graph
            .locks()
            .begin_serializing(graph.name(), graph.is_system() && graph.inbound_listener_bound())?;

        let prev = match super::load_state(graph) {
            Ok(prev) => prev,
            Err(e) => {
                self.stats.lock().failed += 1;
                let e = Error::snapshot(graph.name(), e);
                tracing::error!("{}", e);
                return Err(e);
            }
        };

        let budget = if budget.is_zero() {
            self.config.readonly_timeout
        } else {
            budget
        };
        self.set_phase(graph, SnapshotPhase::AcquiringReadonly);
        let readonly = match graph.locks().acquire_readonly(graph.name(), budget) {
            Ok(guard) => guard,
            Err(e) => {
                self.set_phase(graph, SnapshotPhase::Idle);
                self.stats.lock().failed += 1;
                tracing::error!("{}", e);
                return Err(e);
            }
        };

        self.set_phase(graph, SnapshotPhase::Serializing);
        tracing::info!(
            "Serializing graph '{}'{} to {}",
            graph.name(),
            if force { " (forced)" } else { "" },
            graph.dir().display()
        );
        let rollbacks = self.stats.lock().rollbacks;
        let result = self.serialize_locked(graph, &prev, force, started);

        self.set_phase(graph, SnapshotPhase::Releasing);
        drop(readonly);
        drop(serializing);

        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                let rolled_back = self.stats.lock().rollbacks > rollbacks;
                self.set_phase(
                    graph,
                    if rolled_back {
                        SnapshotPhase::RolledBack
                    } else {
                        SnapshotPhase::Failed
                    },
                );
                self.stats.lock().failed += 1;
                tracing::error!("{}", e);
                return Err(e);
            }
        };
        self.set_phase(graph, SnapshotPhase::Committed);

        if remote && !graph.locks().is_readonly() {
            let ops = vec![
                Operation::Persist {
                    durable: report.state.graph.tx_in.last,
                    persisted_ts: report.state.time.persist_t1,
                },
                Operation::State {
                    counts: report.state.counts(),
                },
            ];
            match graph.capture(ops) {
                Ok(point) => report.emitted = point,
                Err(e) => tracing::warn!("Failed to emit persist record for '{}': {}", graph.name(), e),
            }
        }

        let readers = graph.locks().readonly_count();
        if readers > 0 {
            tracing::info!(
                "Graph '{}' still READONLY after serialization (reader(s): {})",
                graph.name(),
                readers
            );
        }

        report.duration = started.elapsed();
        {
            let mut stats = self.stats.lock();
            stats.completed += 1;
            if force {
                stats.forced += 1;
            }
            stats.last_duration = report.duration;
            stats.last_words = report.words_written;
        }
        tracing::info!(
            "Serialization of '{}' complete ({:.1} seconds, {} words)",
            graph.name(),
            report.duration.as_secs_f64(),
            report.words_written
        );
        Ok(report)
    }

    fn serialize_locked(
        &self,
        graph: &Graph,
        prev: &GraphState,
        force: bool,
        started: Instant,
    ) -> Result<SnapshotReport> {
        let counts = graph.counts();
        tracing::info!(
            "Graph '{}': order={} size={} properties={} vectors={} (previous snapshots: {})",
            graph.name(),
            counts.order,
            counts.size,
            counts.properties,
            counts.vectors,
            prev.time.persist_n
        );

        let aside = if force {
            self.set_aside(graph, prev)
        } else {
            None
        };

        let outcome = self
            .relocate_into_aside(graph, aside.as_deref())
            .and_then(|_| self.write_snapshot(graph, prev, force, aside.as_deref(), started))
            .and_then(|report| {
                if let Some(aside) = &aside {
                    finalize_aside(graph, aside)?;
                }
                Ok(report)
            });

        match outcome {
            Ok(report) => {
                graph.durability().mark(DurabilityPoint {
                    tx: report.state.graph.tx_in.last,
                    persisted_ts: report.state.time.persist_t1,
                });
                Ok(report)
            }
            Err(e) => {
                if force {
                    self.rollback(graph, aside.as_deref());
                }
                Err(Error::snapshot(graph.name(), e))
            }
        }
    }

    /// Rename the graph directory aside; `None` means overwrite in place
    fn set_aside(&self, graph: &Graph, prev: &GraphState) -> Option<PathBuf> {
        let ts = if self.config.aside_suffix_ts && prev.time.persist_t1 > 0 {
            prev.time.persist_t1
        } else {
            now_millis()
        };
        let aside = paths::free_aside_dir(graph.dir(), ts);
        let vprop = graph.virtual_properties();
        if let Some(log) = &vprop {
            log.close();
        }
        match std::fs::rename(graph.dir(), &aside) {
            Ok(()) => {
                tracing::info!(
                    "Previous data of '{}' set aside to {}",
                    graph.name(),
                    aside.display()
                );
                Some(aside)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to set aside {} ({}), overwriting in place",
                    graph.dir().display(),
                    e
                );
                if let Some(log) = &vprop {
                    let path = log.path();
                    if let Err(e) = log.reopen_at(&path) {
                        tracing::error!("Failed to reopen {}: {}", path.display(), e);
                    }
                }
                None
            }
        }
    }

    fn relocate_into_aside(&self, graph: &Graph, aside: Option<&Path>) -> Result<()> {
        let Some(aside) = aside else {
            return Ok(());
        };
        std::fs::create_dir_all(graph.dir()).fs_context("create_dir", graph.dir())?;
        if let Some(log) = graph.virtual_properties() {
            log.reopen_at(&paths::vprop_path(aside, graph.name()))?;
        }
        Ok(())
    }

    /// Collaborators, superblock and report
    ///
    /// The virtual property log is committed here only when it lives in the
    /// graph directory. With an aside, [`finalize_aside`] commits it once it
    /// is back home so the aside never holds a log ahead of its superblock.
    fn write_snapshot(
        &self,
        graph: &Graph,
        prev: &GraphState,
        force: bool,
        aside: Option<&Path>,
        started: Instant,
    ) -> Result<SnapshotReport> {
        let persist_t0 = now_millis();
        let mut words = 0u64;
        for (order, collaborator) in graph.collaborators().ordered() {
            if order.is_type_index() && collaborator.item_count() == 0 {
                collaborator.erase()?;
                tracing::debug!(collaborator = collaborator.name(), %order, "erased empty index");
                continue;
            }
            let n = collaborator.bulk_serialize(force)?;
            tracing::debug!(collaborator = collaborator.name(), %order, words = n, "serialized");
            words += n;
        }

        let mut state = GraphState::from_graph(graph);
        state.graph.readonly = true;
        state.graph.n_ops = state.graph.opcount.saturating_sub(prev.graph.opcount);
        state.time.persist_t0 = persist_t0;
        state.time.persist_t1 = now_millis();
        state.time.persist_n = prev.time.persist_n + 1;
        state.time.persist_t = prev.time.persist_t + started.elapsed().as_millis() as u64;

        words += state.write_to_dir(graph.dir())?;
        if self.config.write_report {
            if let Err(e) = report::write_report(graph.dir(), &state) {
                tracing::warn!("Failed to write state report for '{}': {}", graph.name(), e);
            }
        }

        if aside.is_none() {
            if let Some(log) = graph.virtual_properties() {
                commit_virtual_properties(&log)?;
            }
        }

        Ok(SnapshotReport {
            words_written: words,
            duration: started.elapsed(),
            state,
            forced: force,
            emitted: None,
        })
    }

    fn rollback(&self, graph: &Graph, aside: Option<&Path>) {
        let Some(aside) = aside else {
            tracing::error!("No previous data can be restored for '{}'", graph.name());
            return;
        };
        tracing::warn!(
            "Rolling back '{}' from {}",
            graph.name(),
            aside.display()
        );
        if let Some(log) = graph.virtual_properties() {
            log.close();
        }
        if graph.dir().exists() {
            if let Err(e) = std::fs::remove_dir_all(graph.dir()) {
                tracing::error!("Failed to remove {}: {}", graph.dir().display(), e);
                return;
            }
        }
        if let Err(e) = std::fs::rename(aside, graph.dir()) {
            tracing::error!(
                "Failed to restore {} from {}: {}",
                graph.dir().display(),
                aside.display(),
                e
            );
            return;
        }
        if let Some(log) = graph.virtual_properties() {
            let path = paths::vprop_path(graph.dir(), graph.name());
            if let Err(e) = log.reopen_at(&path) {
                tracing::error!("Failed to reopen {}: {}", path.display(), e);
            }
        }
        self.stats.lock().rollbacks += 1;
    }

    /// Reload the superblock and every collaborator; returns words read
    pub fn restore(&self, graph: &Graph) -> Result<u64> {
        let state = super::load_state(graph)?;
        graph.apply_state(&state);
        let mut words = 0;
        for (order, collaborator) in graph.collaborators().ordered() {
            let n = collaborator.restore_objects()?;
            tracing::debug!(collaborator = collaborator.name(), %order, words = n, "restored");
            words += n;
        }
        tracing::info!(
            "Restored graph '{}' (order={} size={}, {} words)",
            graph.name(),
            state.graph.order,
            state.graph.size,
            words
        );
        Ok(words)
    }
}

fn commit_virtual_properties(log: &VirtualPropertyLog) -> Result<u64> {
    log.commit()
        .map_err(|e| Error::corruption(format!("Failed to commit virtual properties: {}", e)))
}

/// Move the virtual property log home, commit it and drop the aside directory
fn finalize_aside(graph: &Graph, aside: &Path) -> Result<()> {
    let target = paths::vprop_path(graph.dir(), graph.name());
    match graph.virtual_properties() {
        Some(log) => {
            log.move_to(&target)?;
            if let Err(e) = commit_virtual_properties(&log) {
                // Back into the aside so the rollback restores it
                let home = paths::vprop_path(aside, graph.name());
                if let Err(back) = log.move_to(&home) {
                    tracing::error!("Failed to return {} to {}: {}", target.display(), home.display(), back);
                }
                return Err(e);
            }
        }
        None => {
            let stale = paths::vprop_path(aside, graph.name());
            if stale.exists() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).fs_context("create_dir", parent)?;
                }
                std::fs::rename(&stale, &target).fs_context("rename", &stale)?;
            }
        }
    }
    if let Err(e) = std::fs::remove_dir_all(aside) {
        tracing::warn!("Failed to remove {}: {}", aside.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::graph::SerialOrder;
    use crate::testing::{MemoryCollaborator, TestContext, test_graph};
    use std::sync::Arc;

    #[test]
    fn test_snapshot_writes_state() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "people");
        graph.update_counts(|c| c.order = 5);
        let report = graph.persist(Duration::from_secs(1), false, false).unwrap();
        assert_eq!(report.state.time.persist_n, 1);
        assert!(report.state.graph.readonly);
        assert!(paths::graphstate_path(graph.dir(), "people").exists());
        assert!(paths::report_path(graph.dir(), "people").exists());
        assert_eq!(graph.snapshot().phase(), SnapshotPhase::Committed);
        assert!(!graph.locks().is_readonly());
        assert!(!graph.locks().is_serializing());

        let again = graph.persist(Duration::from_secs(1), false, false).unwrap();
        assert_eq!(again.state.time.persist_n, 2);
        assert!(again.state.time.persist_t >= report.state.time.persist_t);
    }

    #[test]
    fn test_type_index_erased_when_empty() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        let index = Arc::new(MemoryCollaborator::new("type-index", graph.dir()));
        index.set_items(vec![b"x".to_vec()]);
        graph.add_collaborator(SerialOrder::TypeIndex(1), index.clone());
        graph.persist(Duration::from_secs(1), false, false).unwrap();
        assert!(index.path().exists());

        index.set_items(Vec::new());
        graph.persist(Duration::from_secs(1), false, false).unwrap();
        assert!(!index.path().exists());
    }

    #[test]
    fn test_readonly_timeout_leaves_idle() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        let g2 = graph.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _w = g2.locks().lock_vertex_writable().unwrap();
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        rx.recv().unwrap();
        let err = graph
            .persist(Duration::from_millis(30), false, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(graph.snapshot().phase(), SnapshotPhase::Idle);
        assert!(!graph.locks().is_serializing());
        assert_eq!(graph.snapshot().stats().failed, 1);
        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_unreadable_state_fails_before_readonly() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        graph.persist(Duration::from_secs(1), false, false).unwrap();
        std::fs::write(paths::graphstate_path(graph.dir(), "g"), b"not a superblock").unwrap();

        // A foreign writer would make any readonly wait time out
        let g2 = graph.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _w = g2.locks().lock_vertex_writable().unwrap();
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        rx.recv().unwrap();

        let err = graph
            .persist(Duration::from_millis(200), false, false)
            .unwrap_err();
        assert_ne!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("Error during serialization of 'g'"));
        assert_eq!(graph.snapshot().phase(), SnapshotPhase::Idle);
        assert!(!graph.locks().is_readonly());
        assert!(!graph.locks().is_serializing());
        assert_eq!(graph.snapshot().stats().failed, 1);
        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_serializing_with_own_locks_rejected() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        let _w = graph.locks().lock_vertex_writable().unwrap();
        let err = graph.persist(Duration::from_millis(10), false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(err.to_string().contains("writable:[1] readonly:[0]"));
    }

    #[test]
    fn test_forced_snapshot_replaces_directory() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        let vprop = graph.open_virtual_properties().unwrap();
        let r = vprop.write(1, "bio", "first", None).unwrap();
        graph.persist(Duration::from_secs(1), false, false).unwrap();
        std::fs::write(graph.dir().join("stale.tmp"), b"junk").unwrap();

        let report = graph.persist(Duration::from_secs(1), true, false).unwrap();
        assert!(report.forced);
        assert!(!graph.dir().join("stale.tmp").exists());
        assert!(paths::list_asides(graph.dir()).unwrap().is_empty());
        assert_eq!(vprop.path(), paths::vprop_path(graph.dir(), "g"));
        assert_eq!(vprop.read(r).unwrap(), "first");
    }

    #[test]
    fn test_forced_failure_rolls_back() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        let vprop = graph.open_virtual_properties().unwrap();
        let r = vprop.write(1, "bio", "kept", None).unwrap();
        let store = Arc::new(MemoryCollaborator::new("store", graph.dir()));
        store.set_items(vec![b"one".to_vec()]);
        graph.add_collaborator(SerialOrder::VertexAllocator, store.clone());
        graph.persist(Duration::from_secs(1), false, false).unwrap();
        let before = std::fs::read(store.path()).unwrap();

        store.set_items(vec![b"two".to_vec(), b"three".to_vec()]);
        store.fail_next_serialize();
        let err = graph.persist(Duration::from_secs(1), true, false).unwrap_err();
        assert!(err.to_string().contains("Error during serialization of 'g'"));
        assert_eq!(graph.snapshot().phase(), SnapshotPhase::RolledBack);
        assert_eq!(graph.snapshot().stats().rollbacks, 1);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert!(paths::list_asides(graph.dir()).unwrap().is_empty());
        assert_eq!(vprop.read(r).unwrap(), "kept");
    }

    #[test]
    fn test_plain_failure_is_not_a_rollback() {
        let ctx = TestContext::new();
        let graph = test_graph(&ctx, "g");
        let store = Arc::new(MemoryCollaborator::new("store", graph.dir()));
        graph.add_collaborator(SerialOrder::VertexAllocator, store.clone());
        store.fail_next_serialize();

        let err = graph.persist(Duration::from_secs(1), false, false).unwrap_err();
        assert!(err.to_string().contains("Error during serialization of 'g'"));
        assert_eq!(graph.snapshot().phase(), SnapshotPhase::Failed);
        assert_eq!(graph.snapshot().stats().rollbacks, 0);
        assert_eq!(graph.snapshot().stats().failed, 1);

        graph.persist(Duration::from_secs(1), false, false).unwrap();
        assert_eq!(graph.snapshot().phase(), SnapshotPhase::Committed);
    }

    #[test]
    fn test_interrupted_forced_snapshot_keeps_log_at_old_watermark() {
        let ctx = TestContext::new();
        let (dir, sealed, pending, watermark) = {
            let graph = test_graph(&ctx, "g");
            let vprop = graph.open_virtual_properties().unwrap();
            let sealed = vprop.write(1, "bio", "sealed", None).unwrap();
            graph.persist(Duration::from_secs(1), false, false).unwrap();
            let watermark = vprop.commit_watermark();
            let pending = vprop.write(2, "bio", "pending", None).unwrap();

            // Forced snapshot up to the new superblock, then stop short of
            // moving the log home
            let coordinator = graph.snapshot();
            let prev = super::super::load_state(&graph).unwrap();
            let aside = coordinator.set_aside(&graph, &prev).unwrap();
            coordinator.relocate_into_aside(&graph, Some(&aside)).unwrap();
            coordinator
                .write_snapshot(&graph, &prev, true, Some(&aside), Instant::now())
                .unwrap();
            assert_eq!(vprop.commit_watermark(), watermark);
            vprop.close();
            (graph.dir().to_path_buf(), sealed, pending, watermark)
        };

        let recovery = super::super::recover_interrupted(&dir, "g").unwrap();
        assert!(matches!(recovery, super::super::Recovery::Restored(_)));
        let graph = test_graph(&ctx, "g");
        let vprop = graph.open_virtual_properties().unwrap();
        assert_eq!(vprop.commit_watermark(), watermark);
        assert_eq!(vprop.stats().count, 1);
        assert_eq!(vprop.read(sealed).unwrap(), "sealed");
        assert!(vprop.read(pending).is_err());
    }
}
