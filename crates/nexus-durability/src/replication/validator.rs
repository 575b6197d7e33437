//! Anti-replay validation of inbound transactions

use crate::graph::GraphId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rejects inbound transactions whose serial does not advance per graph
#[derive(Debug, Default)]
pub struct TxValidator {
    last: Mutex<HashMap<GraphId, u64>>,
    rejected: AtomicU64,
}

impl TxValidator {
    /// Create an empty validator
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `serial` for `graph` if it is newer than the last accepted one
    pub fn check(&self, graph: GraphId, serial: u64) -> bool {
        let mut last = self.last.lock();
        let seen = last.entry(graph).or_insert(0);
        if serial > *seen {
            *seen = serial;
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                graph = %graph,
                serial,
                last = *seen,
                "Dropped replayed transaction"
            );
            false
        }
    }

    /// Last accepted serial for `graph`
    pub fn last_serial(&self, graph: GraphId) -> Option<u64> {
        self.last.lock().get(&graph).copied()
    }

    /// Forget all graphs
    pub fn reset(&self) {
        self.last.lock().clear();
    }

    /// Transactions dropped so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
