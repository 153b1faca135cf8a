//! # vrift-config
//!
//! Static configuration for the vrift content store.
//!
//! Loads configuration from:
//! 1. `~/.vrift/store.toml` (global)
//! 2. `.vrift/store.toml` (project-local, each section present overrides global)
//! 3. Environment variables (highest priority)
//!
//! Every value is fixed for the lifetime of a process. The loaded [`Config`]
//! is passed explicitly into store constructors; there is no global instance.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Most shards a store may be partitioned into (one leading hash byte).
pub const MAX_SHARDS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub gc: GcConfig,
}

/// Project-level overrides: a section replaces the global one only when present.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    local: Option<LocalConfig>,
    remote: Option<RemoteConfig>,
    gc: Option<GcConfig>,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        Self::load_from(global.as_deref(), Some(Path::new(".vrift/store.toml")))
    }

    /// Load from explicit global and project files; missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = global.filter(|p| p.exists()) {
            debug!("Loading global config from {:?}", global_path);
            let contents = std::fs::read_to_string(global_path)?;
            config = toml::from_str(&contents)?;
        }

        if let Some(project_path) = project.filter(|p| p.exists()) {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let overlay: ConfigOverlay = toml::from_str(&contents)?;
            config.merge(overlay);
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.vrift/store.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vrift/store.toml"))
    }

    fn merge(&mut self, overlay: ConfigOverlay) {
        if let Some(local) = overlay.local {
            self.local = local;
        }
        if let Some(remote) = overlay.remote {
            self.remote = remote;
        }
        if let Some(gc) = overlay.gc {
            self.gc = gc;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("VRIFT_STORE_ROOT") {
            self.local.root = PathBuf::from(path);
        }
        if let Some(n) = env_parse("VRIFT_SHARD_COUNT") {
            self.local.shard_count = n;
        }
        if let Some(n) = env_parse("VRIFT_SIZE_BUDGET") {
            self.gc.size_budget = n;
        }
        if let Some(n) = env_parse("VRIFT_REMOTE_RETRIES") {
            self.remote.retries = n;
        }
    }

    /// Reject static values no store could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let local = &self.local;
        if local.shard_count == 0 || local.shard_count > MAX_SHARDS {
            return Err(invalid(
                "local.shard_count",
                format!("must be between 1 and {MAX_SHARDS}, got {}", local.shard_count),
            ));
        }
        if local.large_blob_threshold == 0 {
            return Err(invalid("local.large_blob_threshold", "must be at least 1 byte"));
        }
        if local.shard_map_size == 0 {
            return Err(invalid("local.shard_map_size", "must be non-zero"));
        }

        let remote = &self.remote;
        if remote.max_batch_digests == 0 {
            return Err(invalid("remote.max_batch_digests", "must be non-zero"));
        }
        if remote.max_batch_total_bytes == 0 {
            return Err(invalid("remote.max_batch_total_bytes", "must be non-zero"));
        }
        if remote.chunk_size == 0 {
            return Err(invalid("remote.chunk_size", "must be non-zero"));
        }
        if remote.upload_concurrency == 0 {
            return Err(invalid("remote.upload_concurrency", "must be non-zero"));
        }
        if remote.initial_backoff_ms > remote.max_backoff_ms {
            return Err(invalid(
                "remote.initial_backoff_ms",
                format!(
                    "{} exceeds max_backoff_ms {}",
                    remote.initial_backoff_ms, remote.max_backoff_ms
                ),
            ));
        }

        if !(0.0..=1.0).contains(&self.gc.target_ratio) {
            return Err(invalid(
                "gc.target_ratio",
                format!("must be within 0.0..=1.0, got {}", self.gc.target_ratio),
            ));
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Local store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Store root; holds `lmdb/` (one environment per shard) and `large/`
    pub root: PathBuf,
    /// Number of LMDB shards. Changing it orphans previously written data.
    pub shard_count: usize,
    /// Blobs of at least this many bytes live as files instead of LMDB values
    pub large_blob_threshold: u64,
    /// LMDB map size per shard, in bytes
    pub shard_map_size: usize,
    /// Memory-map large blobs on load (buffered reads otherwise)
    pub use_mmap: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.vrift/store"),
            shard_count: 16,
            large_blob_threshold: 512 * 1024,
            shard_map_size: 1024 * 1024 * 1024,
            use_mmap: true,
        }
    }
}

impl LocalConfig {
    /// The root with a leading `~/` expanded to the home directory.
    pub fn resolved_root(&self) -> PathBuf {
        match self.root.strip_prefix("~") {
            Ok(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| self.root.clone()),
            Err(_) => self.root.clone(),
        }
    }
}

/// Remote CAS client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Whether a remote store should be attached
    pub enabled: bool,
    /// Instance name sent with every request
    pub instance_name: String,
    /// Most digests per FindMissingBlobs / BatchRead request
    pub max_batch_digests: usize,
    /// Largest total payload of one batch request; bigger blobs are streamed
    pub max_batch_total_bytes: u64,
    /// Chunk size for streamed uploads
    pub chunk_size: usize,
    /// Retries after the first attempt for transient failures
    pub retries: u32,
    /// First backoff delay; doubles per attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on a single backoff delay
    pub max_backoff_ms: u64,
    /// Deadline for one remote call
    pub request_timeout_ms: u64,
    /// Concurrent upload requests per `upload_all`
    pub upload_concurrency: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_name: String::new(),
            max_batch_digests: 2048,
            max_batch_total_bytes: 4 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            retries: 3,
            initial_backoff_ms: 20,
            max_backoff_ms: 5000,
            request_timeout_ms: 30_000,
            upload_concurrency: 16,
        }
    }
}

/// Garbage collection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Local bytes above which a collection runs
    pub size_budget: u64,
    /// A collection shrinks the store to `size_budget * target_ratio`
    pub target_ratio: f64,
    /// Entries accessed within this window are leased and never evicted
    pub lease_retention_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            size_budget: 64 * 1024 * 1024 * 1024,
            target_ratio: 0.75,
            lease_retention_secs: 2 * 60 * 60,
        }
    }
}

impl GcConfig {
    /// Byte size a collection shrinks to.
    pub fn target_bytes(&self) -> u64 {
        (self.size_budget as f64 * self.target_ratio) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.local.shard_count, 16);
        assert!(!config.remote.enabled);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[local]"));
        assert!(toml_str.contains("[remote]"));
        assert!(toml_str.contains("[gc]"));
        assert!(toml_str.contains("large_blob_threshold"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let mut config = Config::default();
        config.local.shard_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "local.shard_count", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_too_many_shards() {
        let mut config = Config::default();
        config.local.shard_count = MAX_SHARDS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.remote.initial_backoff_ms = 10_000;
        config.remote.max_backoff_ms = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "remote.initial_backoff_ms", .. })
        ));
    }

    #[test]
    fn test_target_bytes() {
        let gc = GcConfig {
            size_budget: 1000,
            target_ratio: 0.5,
            lease_retention_secs: 0,
        };
        assert_eq!(gc.target_bytes(), 500);
    }

    #[test]
    fn test_resolved_root_expands_home() {
        let local = LocalConfig::default();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(local.resolved_root(), home.join(".vrift/store"));
        }

        let absolute = LocalConfig {
            root: PathBuf::from("/var/cache/vrift"),
            ..LocalConfig::default()
        };
        assert_eq!(absolute.resolved_root(), PathBuf::from("/var/cache/vrift"));
    }
}
