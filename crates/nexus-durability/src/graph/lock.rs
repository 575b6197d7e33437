//! Graph-wide lock facade
//!
//! Tracks the three pieces of lock state the durability core coordinates with:
//!
//! - graph-wide readonly (recursive count) which blocks new writable vertex locks
//! - vertex locks, globally and per calling thread
//! - the recursive "serializing" counter
//!
//! All counters live behind one mutex so snapshot-start checks and readonly
//! transitions are atomic with respect to each other.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Vertex locks held by one thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadLocks {
    /// Writable vertex locks
    pub writable: u64,
    /// Readonly vertex locks
    pub readonly: u64,
}

impl ThreadLocks {
    /// Total locks held
    pub fn total(&self) -> u64 {
        self.writable + self.readonly
    }
}

#[derive(Debug, Default)]
struct LockState {
    readonly: u32,
    writable_vertices: u64,
    readonly_vertices: u64,
    serializing: u32,
    per_thread: HashMap<ThreadId, ThreadLocks>,
}

/// Lock state shared by a graph and the durability core
#[derive(Debug, Default)]
pub struct GraphLocks {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl GraphLocks {
    /// Create unlocked state
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks held by the calling thread
    pub fn thread_locks(&self) -> ThreadLocks {
        let state = self.state.lock();
        state
            .per_thread
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or_default()
    }

    /// Writable vertex locks held by all threads
    pub fn writable_count(&self) -> u64 {
        self.state.lock().writable_vertices
    }

    /// Readonly recursion count
    pub fn readonly_count(&self) -> u32 {
        self.state.lock().readonly
    }

    /// True while any graph-wide readonly is held
    pub fn is_readonly(&self) -> bool {
        self.readonly_count() > 0
    }

    /// True while a snapshot runs
    pub fn is_serializing(&self) -> bool {
        self.state.lock().serializing > 0
    }

    /// Acquire a writable vertex lock; refused while the graph is readonly
    pub fn lock_vertex_writable(&self) -> Result<VertexLockGuard<'_>> {
        let mut state = self.state.lock();
        if state.readonly > 0 {
            return Err(Error::state(format!(
                "Graph is readonly (readers: {}), writable vertex lock refused",
                state.readonly
            )));
        }
        state.writable_vertices += 1;
        state
            .per_thread
            .entry(std::thread::current().id())
            .or_default()
            .writable += 1;
        Ok(VertexLockGuard {
            locks: self,
            writable: true,
            owner: std::thread::current().id(),
        })
    }

    /// Acquire a readonly vertex lock
    pub fn lock_vertex_readonly(&self) -> VertexLockGuard<'_> {
        let mut state = self.state.lock();
        state.readonly_vertices += 1;
        state
            .per_thread
            .entry(std::thread::current().id())
            .or_default()
            .readonly += 1;
        VertexLockGuard {
            locks: self,
            writable: false,
            owner: std::thread::current().id(),
        }
    }

    fn release_vertex(&self, writable: bool, owner: ThreadId) {
        let mut state = self.state.lock();
        if writable {
            state.writable_vertices = state.writable_vertices.saturating_sub(1);
        } else {
            state.readonly_vertices = state.readonly_vertices.saturating_sub(1);
        }
        let empty = match state.per_thread.get_mut(&owner) {
            Some(held) => {
                if writable {
                    held.writable = held.writable.saturating_sub(1);
                } else {
                    held.readonly = held.readonly.saturating_sub(1);
                }
                held.total() == 0
            }
            None => false,
        };
        if empty {
            state.per_thread.remove(&owner);
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Acquire graph-wide readonly within `budget`
    ///
    /// Waits for writable vertex locks held by other threads to drain. Fails
    /// immediately if the calling thread itself holds a writable lock.
    pub fn acquire_readonly(&self, graph: &str, budget: Duration) -> Result<ReadonlyGuard<'_>> {
        let deadline = Instant::now() + budget;
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        loop {
            let own = state.per_thread.get(&me).map(|t| t.writable).unwrap_or(0);
            if own > 0 {
                return Err(Error::state(format!(
                    "Cannot acquire graph '{}' readonly while current thread holds {} writable vertex locks",
                    graph, own
                )));
            }
            if state.writable_vertices == 0 {
                state.readonly += 1;
                return Ok(ReadonlyGuard { locks: self });
            }
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && state.writable_vertices > 0
            {
                return Err(Error::timeout(format!(
                    "Cannot serialize, unable to acquire graph '{}' readonly (WL vertices: {})",
                    graph, state.writable_vertices
                )));
            }
        }
    }

    /// Take graph-wide readonly if no writable vertex lock is held
    ///
    /// Returns `Ok(None)` while other threads hold writable locks.
    pub fn try_acquire_readonly(&self, graph: &str) -> Result<Option<ReadonlyGuard<'_>>> {
        let mut state = self.state.lock();
        let own = state
            .per_thread
            .get(&std::thread::current().id())
            .map(|t| t.writable)
            .unwrap_or(0);
        if own > 0 {
            return Err(Error::state(format!(
                "Cannot acquire graph '{}' readonly while current thread holds {} writable vertex locks",
                graph, own
            )));
        }
        if state.writable_vertices > 0 {
            return Ok(None);
        }
        state.readonly += 1;
        Ok(Some(ReadonlyGuard { locks: self }))
    }

    /// [`acquire_readonly`](Self::acquire_readonly) for async callers
    ///
    /// Polls instead of parking the runtime worker on the condvar.
    pub async fn acquire_readonly_async(
        &self,
        graph: &str,
        budget: Duration,
    ) -> Result<ReadonlyGuard<'_>> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if let Some(guard) = self.try_acquire_readonly(graph)? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "Cannot serialize, unable to acquire graph '{}' readonly (WL vertices: {})",
                    graph,
                    self.writable_count()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn release_readonly(&self) {
        let mut state = self.state.lock();
        state.readonly = state.readonly.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    /// Check snapshot preconditions and mark the graph as serializing
    ///
    /// Checked in order under one lock: no snapshot already running, the
    /// calling thread holds no vertex locks, and the inbound listener is not
    /// bound when this is the system graph.
    pub fn begin_serializing(
        &self,
        graph: &str,
        system_listener_bound: bool,
    ) -> Result<SerializingGuard<'_>> {
        let mut state = self.state.lock();
        if state.serializing > 0 {
            return Err(Error::topology("Serialization already running"));
        }
        let held = state
            .per_thread
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or_default();
        if held.total() > 0 {
            return Err(Error::state(format!(
                "Cannot serialize when current thread holds {} vertex locks ( writable:[{}] readonly:[{}] )",
                held.total(),
                held.writable,
                held.readonly
            )));
        }
        if system_listener_bound {
            return Err(Error::state(format!(
                "Cannot serialize SYSTEM graph '{}' while consumer service is running",
                graph
            )));
        }
        state.serializing += 1;
        Ok(SerializingGuard { locks: self })
    }

    /// Re-enter serializing from inside a running snapshot
    pub fn enter_serializing(&self) -> SerializingGuard<'_> {
        self.state.lock().serializing += 1;
        SerializingGuard { locks: self }
    }
}

/// Holds one vertex lock
pub struct VertexLockGuard<'a> {
    locks: &'a GraphLocks,
    writable: bool,
    owner: ThreadId,
}

impl VertexLockGuard<'_> {
    /// True for a writable lock
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Drop for VertexLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release_vertex(self.writable, self.owner);
    }
}

/// Holds graph-wide readonly
pub struct ReadonlyGuard<'a> {
    locks: &'a GraphLocks,
}

impl Drop for ReadonlyGuard<'_> {
    fn drop(&mut self) {
        self.locks.release_readonly();
    }
}

/// Holds one level of the serializing counter
pub struct SerializingGuard<'a> {
    locks: &'a GraphLocks,
}

impl Drop for SerializingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.locks.state.lock();
        state.serializing = state.serializing.saturating_sub(1);
    }
}
