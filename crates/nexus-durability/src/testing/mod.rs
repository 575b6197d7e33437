//! Testing infrastructure for Nexus Durability
//!
//! - **TestContext**: per-test temporary directory with automatic cleanup
//! - **test_graph**: a graph rooted inside a context
//! - **MemoryCollaborator**: file-backed collaborator for snapshot tests
//! - **MockSubscriber**: TCP subscriber answering handshakes
//! - **StalledConnector**: in-memory transport whose peer never reads
//!
//! Tests touching the process-wide [`System`](crate::system) registry use
//! `serial_test::serial`.

mod collaborator;
mod context;
mod subscriber;

pub use collaborator::MemoryCollaborator;
pub use context::TestContext;
pub use subscriber::{MockSubscriber, StalledConnector};

use crate::durability::MasterSerial;
use crate::graph::{Graph, GraphOptions};
use std::sync::{Arc, Once};

/// Open a graph named `name` under the context directory
pub fn test_graph(ctx: &TestContext, name: &str) -> Arc<Graph> {
    Graph::open(
        GraphOptions::new(name, ctx.path().join(name)),
        Arc::new(MasterSerial::from_clock()),
    )
    .expect("Failed to open test graph")
}

/// Install a `fmt` subscriber honoring `RUST_LOG`, once per process
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
