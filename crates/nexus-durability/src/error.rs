//! Error types for Nexus Durability

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias using the durability Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// open/read/write/seek/rename failure
    Filesystem,
    /// Delimiter, digest or identity mismatch
    Corruption,
    /// A bounded wait expired
    Timeout,
    /// Producer registry or snapshot-start conflict
    Topology,
    /// Caller state would deadlock or is not allowed
    State,
    /// Wire frame could not be decoded
    Protocol,
    /// Invalid configuration
    Config,
}

/// Core error types for the durability and replication subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// File operation failed on a known path
    #[error("Filesystem error: {op} '{}': {source}", path.display())]
    Filesystem {
        /// Operation that failed (open, read, rename, ...)
        op: &'static str,
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O errors without path context (sockets, in-memory codecs)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk or in-stream data failed validation
    #[error("Corruption: {0}")]
    Corruption(String),

    /// A bounded wait expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Replication topology errors
    #[error("Topology error: {0}")]
    Topology(String),

    /// Operation not allowed in the current state
    #[error("State error: {0}")]
    State(String),

    /// Replication wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A snapshot failed; carries the underlying cause
    #[error("Error during serialization of '{graph}': {source}")]
    Snapshot {
        /// Graph being serialized
        graph: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a filesystem error
    pub fn fs(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a snapshot failure
    pub fn snapshot(graph: impl Into<String>, source: Error) -> Self {
        Self::Snapshot {
            graph: graph.into(),
            source: Box::new(source),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Filesystem { .. } | Self::Io(_) => ErrorKind::Filesystem,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Topology(_) => ErrorKind::Topology,
            Self::State(_) => ErrorKind::State,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Config(_) => ErrorKind::Config,
            Self::Snapshot { source, .. } => source.kind(),
        }
    }
}

/// Attach path context to `std::io::Result`
pub trait IoResultExt<T> {
    /// Map an I/O error into [`Error::Filesystem`] for `path`
    fn fs_context(self, op: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn fs_context(self, op: &'static str, path: &Path) -> Result<T> {
        self.map_err(|e| Error::fs(op, path, e))
    }
}
