//! TestContext - owns the temporary directories of one test

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory removed when the context is dropped
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh temporary directory
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        Self { temp_dir }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A named subdirectory, not created yet
    pub fn dir(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Give up cleanup and hand the directory to the caller
    pub fn into_temp_dir(self) -> TempDir {
        self.temp_dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
