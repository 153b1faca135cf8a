//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary store root (LMDB shards + large blob tree)
//! - A scratch directory for source files
//! - A `Config` pointing at both, tuned for fast tests
//!
//! # Usage
//!
//! ```ignore
//! use vrift_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.local.root is unique to this test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Small-blob threshold used by test configs, so large-blob paths are cheap to hit.
pub const TEST_LARGE_BLOB_THRESHOLD: u64 = 1024;

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated store root directory
    pub store_root: PathBuf,
    /// Scratch directory for input files
    pub scratch_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let store_root = root.join(format!("store-{}", test_id));
        let scratch_dir = root.join("scratch");

        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&scratch_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            store_root,
            scratch_dir,
            test_id,
        })
    }

    /// Config rooted in this environment: 4 shards, 1 KiB large-blob
    /// threshold, small map size, no lease retention window.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.local.root = self.store_root.clone();
        cfg.local.shard_count = 4;
        cfg.local.large_blob_threshold = TEST_LARGE_BLOB_THRESHOLD;
        cfg.local.shard_map_size = 64 * 1024 * 1024;
        cfg.gc.lease_retention_secs = 0;
        cfg.remote.initial_backoff_ms = 1;
        cfg.remote.max_backoff_ms = 10;
        cfg.remote.request_timeout_ms = 2_000;
        cfg
    }

    /// Create a scratch file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.store_root.exists());
        assert!(env.scratch_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_roots() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.store_root, env2.store_root);
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("inputs/a.txt", b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_config_is_valid_and_isolated() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        cfg.validate().unwrap();
        assert_eq!(cfg.local.root, env.store_root);
        assert_eq!(cfg.local.large_blob_threshold, TEST_LARGE_BLOB_THRESHOLD);
    }
}
