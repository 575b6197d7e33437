//! Graph snapshots
//!
//! - [`SnapshotCoordinator`]: readonly acquisition, ordered collaborator
//!   serialization, superblock write, aside/rollback
//! - [`GraphState`]: the fixed-size binary superblock and its `.adoc` report
//! - [`recover_interrupted`]: startup repair after a crash mid-snapshot

pub mod config;
pub mod coordinator;
pub mod paths;
pub mod report;
pub mod state;

pub use config::SnapshotConfig;
pub use coordinator::{SnapshotCoordinator, SnapshotPhase, SnapshotReport, SnapshotStats};
pub use state::{
    GRAPHSTATE_BYTES, GRAPHSTATE_VERSION, GraphSection, GraphState, PropertySection, TimeSection,
    VectorSection,
};

use crate::Result;
use crate::error::IoResultExt;
use crate::graph::Graph;
use std::path::{Path, PathBuf};

/// Load the on-disk superblock of `graph`, or describe the live graph when
/// none has been written yet
pub fn load_state(graph: &Graph) -> Result<GraphState> {
    let path = paths::graphstate_path(graph.dir(), graph.name());
    if path.exists() {
        GraphState::read_from_dir(graph.dir(), graph.name())
    } else {
        tracing::debug!("No previous state for '{}', synthesizing", graph.name());
        Ok(GraphState::from_graph(graph))
    }
}

/// What [`recover_interrupted`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// No aside directory found
    Clean,
    /// An interrupted snapshot was undone from this aside
    Restored(PathBuf),
    /// The new snapshot was complete; these asides were removed
    Discarded(Vec<PathBuf>),
}

/// Repair a graph directory after a crash during a forced snapshot
///
/// The newest aside is restored when the graph directory is missing, its
/// superblock does not decode, or the virtual property log never made it back
/// from the aside. Otherwise the asides are stale and removed.
pub fn recover_interrupted(dir: &Path, name: &str) -> Result<Recovery> {
    let asides = paths::list_asides(dir)?;
    let Some(newest) = asides.last().cloned() else {
        return Ok(Recovery::Clean);
    };

    let state_ok = dir.is_dir() && GraphState::read_from_dir(dir, name).is_ok();
    let vprop_stranded = paths::vprop_path(&newest, name).exists();

    if !state_ok || vprop_stranded {
        if dir.exists() {
            std::fs::remove_dir_all(dir).fs_context("remove_dir", dir)?;
        }
        std::fs::rename(&newest, dir).fs_context("rename", &newest)?;
        tracing::warn!(
            "Restored '{}' from interrupted snapshot aside {}",
            name,
            newest.display()
        );
        for stale in &asides[..asides.len() - 1] {
            remove_aside(stale);
        }
        return Ok(Recovery::Restored(newest));
    }

    for aside in &asides {
        remove_aside(aside);
    }
    tracing::info!("Removed {} stale snapshot aside(s) of '{}'", asides.len(), name);
    Ok(Recovery::Discarded(asides))
}

fn remove_aside(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}
