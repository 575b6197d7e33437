//! Snapshot Integration Tests
//!
//! Tests the snapshot workflow end to end:
//! - Superblock round-trip through a process restart
//! - Idempotent non-forced snapshots
//! - Forced snapshot rollback
//! - Recovery after a crash between rename and delete-of-old

use nexus_durability::graph::SerialOrder;
use nexus_durability::snapshot::{self, GraphState, Recovery, paths};
use nexus_durability::testing::{MemoryCollaborator, TestContext};
use nexus_durability::{DurabilityConfig, ErrorKind, Graph, GraphOptions, MasterSerial};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const BUDGET: Duration = Duration::from_secs(2);

fn open(root: &Path, name: &str) -> Arc<Graph> {
    Graph::open(
        GraphOptions::new(name, root.join(name)),
        Arc::new(MasterSerial::from_clock()),
    )
    .unwrap()
}

fn populate(graph: &Graph) {
    graph.update_counts(|c| {
        c.order = 1200;
        c.size = 5400;
        c.properties = 830;
        c.keys = 14;
        c.vectors = 1200;
        c.dimensions = 64;
    });
    for name in ["person", "city", "company"] {
        graph.register_vertex_type(name).unwrap();
    }
    graph.set_vertex_type_order(1, 40);
    for name in ["knows", "lives_in"] {
        graph.register_relationship(name).unwrap();
    }
}

/// Counts and enumerations survive a restart
#[test]
fn test_graphstate_round_trip_across_restart() {
    let ctx = TestContext::new();
    let (counts, enums) = {
        let graph = open(ctx.path(), "social");
        populate(&graph);
        graph.persist(BUDGET, false, false).unwrap();
        (graph.counts(), graph.enumerations())
    };

    let graph = open(ctx.path(), "social");
    graph.restore().unwrap();
    assert_eq!(graph.counts(), counts);
    assert_eq!(graph.enumerations(), enums);

    let state = GraphState::read_from_dir(graph.dir(), "social").unwrap();
    assert_eq!(state.time.persist_n, 1);
    assert_eq!(state.vertex_types.len(), 3);
    assert_eq!(state.vertex_types[1].order, 40);
    assert_eq!(state.relationships[1].name, "lives_in");
}

/// Two consecutive non-forced snapshots with no mutation change nothing
#[test]
fn test_idempotent_snapshots() {
    let ctx = TestContext::new();
    let graph = open(ctx.path(), "g");
    let store = Arc::new(MemoryCollaborator::new("store", graph.dir()));
    store.set_items(vec![b"alpha".to_vec(), b"beta".to_vec()]);
    graph.add_collaborator(SerialOrder::VertexAllocator, store.clone());

    graph.persist(BUDGET, false, false).unwrap();
    let first = std::fs::read(store.path()).unwrap();
    let first_state = GraphState::read_from_dir(graph.dir(), "g").unwrap();

    graph.persist(BUDGET, false, false).unwrap();
    let second = std::fs::read(store.path()).unwrap();
    let second_state = GraphState::read_from_dir(graph.dir(), "g").unwrap();

    assert_eq!(first, second);
    assert_eq!(first_state.counts(), second_state.counts());
    assert_eq!(first_state.properties.properties, second_state.properties.properties);
    assert_eq!(second_state.time.persist_n, 2);
}

/// Collaborators are restored in order after a restart
#[test]
fn test_collaborators_restored() {
    let ctx = TestContext::new();
    {
        let graph = open(ctx.path(), "g");
        let store = Arc::new(MemoryCollaborator::new("store", graph.dir()));
        store.set_items(vec![b"kept".to_vec()]);
        graph.add_collaborator(SerialOrder::VertexAllocator, store);
        graph.persist(BUDGET, false, false).unwrap();
    }
    let graph = open(ctx.path(), "g");
    let store = Arc::new(MemoryCollaborator::new("store", graph.dir()));
    graph.add_collaborator(SerialOrder::VertexAllocator, store.clone());
    assert!(graph.restore().unwrap() > 0);
    assert_eq!(store.items(), vec![b"kept".to_vec()]);
}

/// A second snapshot while one runs is refused
#[test]
fn test_concurrent_snapshot_refused() {
    let ctx = TestContext::new();
    let graph = open(ctx.path(), "g");
    let _running = graph.locks().enter_serializing();
    let err = graph.persist(BUDGET, false, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Topology);
}

/// Crash after the aside rename: the old state comes back whole
#[test]
fn test_crash_after_rename_restores_old() {
    let ctx = TestContext::new();
    let dir = {
        let graph = open(ctx.path(), "g");
        populate(&graph);
        let vprop = graph.open_virtual_properties().unwrap();
        vprop.write(9, "bio", "before the crash", None).unwrap();
        graph.persist(BUDGET, false, false).unwrap();
        graph.dir().to_path_buf()
    };

    // Simulate: directory renamed aside with the log, new directory half written
    let aside = paths::aside_dir(&dir, 1_700_000_000, 0);
    std::fs::rename(&dir, &aside).unwrap();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(paths::graphstate_path(&dir, "g"), b"partial").unwrap();

    assert_eq!(
        snapshot::recover_interrupted(&dir, "g").unwrap(),
        Recovery::Restored(aside.clone())
    );

    let graph = open(ctx.path(), "g");
    graph.restore().unwrap();
    assert_eq!(graph.counts().order, 1200);
    let vprop = graph.open_virtual_properties().unwrap();
    assert_eq!(vprop.stats().count, 1);
}

/// Crash before the old directory was deleted: the new state is kept
#[test]
fn test_crash_before_delete_keeps_new() {
    let ctx = TestContext::new();
    let dir = {
        let graph = open(ctx.path(), "g");
        graph.update_counts(|c| c.order = 1);
        graph.persist(BUDGET, false, false).unwrap();
        let old = graph.dir().to_path_buf();

        graph.update_counts(|c| c.order = 2);
        graph.persist(BUDGET, true, false).unwrap();
        old
    };
    // Leftover aside with the previous superblock
    let aside = paths::aside_dir(&dir, 42, 0);
    std::fs::create_dir_all(&aside).unwrap();
    std::fs::write(paths::graphstate_path(&aside, "g"), b"old").unwrap();

    assert!(matches!(
        snapshot::recover_interrupted(&dir, "g").unwrap(),
        Recovery::Discarded(_)
    ));
    let graph = open(ctx.path(), "g");
    graph.restore().unwrap();
    assert_eq!(graph.counts().order, 2);
}

/// System open repairs an interrupted graph before loading it
#[test]
fn test_system_recovers_on_open() {
    let ctx = TestContext::new();
    {
        let system = nexus_durability::System::new(ctx.path(), DurabilityConfig::default()).unwrap();
        let g = system.create_graph("g", false).unwrap();
        g.update_counts(|c| c.order = 77);
        g.persist(BUDGET, false, false).unwrap();
    }
    let dir = ctx.path().join("g");
    let aside = paths::aside_dir(&dir, 5, 0);
    std::fs::rename(&dir, &aside).unwrap();

    let system = nexus_durability::System::new(ctx.path(), DurabilityConfig::default()).unwrap();
    let g = system.create_graph("g", false).unwrap();
    assert_eq!(g.counts().order, 77);
    assert!(!aside.exists());
}
