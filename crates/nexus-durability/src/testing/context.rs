//! TestContext - Manages test lifecycle and resource cleanup
//!
//! Each test gets its own temporary directory, removed when the context is
//! dropped, so graph directories and snapshot asides never leak between
//! tests running in parallel.

use std::path::Path;
use tempfile::TempDir;

/// Context for managing test resources and lifecycle
///
/// # Example
///
/// ```rust,no_run
/// use nexus_durability::testing::{TestContext, test_graph};
///
/// let ctx = TestContext::new();
/// let graph = test_graph(&ctx, "people");
/// assert!(graph.dir().starts_with(ctx.path()));
/// ```
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new TestContext with a unique temporary directory
    ///
    /// The directory is guaranteed to exist before this function returns.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Get the path to the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Keep the directory alive beyond the context
    pub fn into_temp_dir(self) -> TempDir {
        self.temp_dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creates_directory() {
        let ctx = TestContext::new();
        assert!(ctx.path().is_dir(), "Test path should be a directory");
    }

    #[test]
    fn test_context_cleanup_on_drop() {
        let path = {
            let ctx = TestContext::new();
            std::fs::write(ctx.path().join("test.txt"), "test").unwrap();
            ctx.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
