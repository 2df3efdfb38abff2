//! TestContext - owns the temporary directory of one test

use crate::store::{Store, StoreOptions};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Map size used by test stores (64 MiB)
pub const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Context for managing test resources and lifecycle
///
/// Every store opened through the context lives in a subdirectory of one
/// temporary directory, removed when the context is dropped. Keep the
/// context alive for as long as its stores are in use.
///
/// # Example
///
/// ```rust,no_run
/// use chronokv_core::testing::TestContext;
///
/// let ctx = TestContext::new();
/// let store = ctx.open_store("node-a");
/// let txn = store.read_txn().unwrap();
/// assert_eq!(store.log_len(&txn).unwrap(), 0);
/// ```
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new TestContext with a unique temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        Self { temp_dir }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Directory that [`open_store`](Self::open_store) uses for `name`
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Open (or reopen) the store called `name` with a random origin
    pub fn open_store(&self, name: &str) -> Store {
        self.open_with(name, StoreOptions::default().with_map_size(TEST_MAP_SIZE))
    }

    /// Open the store called `name` with a pinned origin id
    pub fn open_store_with_origin(&self, name: &str, origin: u32) -> Store {
        self.open_with(
            name,
            StoreOptions::default()
                .with_map_size(TEST_MAP_SIZE)
                .with_origin(origin),
        )
    }

    fn open_with(&self, name: &str, options: StoreOptions) -> Store {
        Store::open(self.store_path(name), options).expect("Failed to open test store")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
