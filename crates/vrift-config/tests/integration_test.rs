//! Integration tests for vrift-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;
use vrift_config::{Config, ConfigError};

/// Test config loading from real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("store.toml");

    let config_content = r#"
[local]
root = "/custom/store"
shard_count = 32
large_blob_threshold = 65536

[remote]
enabled = true
instance_name = "main"
max_batch_digests = 100

[gc]
size_budget = 1073741824
"#;
    std::fs::write(&global, config_content).unwrap();

    let config = Config::load_from(Some(&global), None).unwrap();

    assert_eq!(config.local.root, PathBuf::from("/custom/store"));
    assert_eq!(config.local.shard_count, 32);
    assert_eq!(config.local.large_blob_threshold, 65536);
    assert!(config.remote.enabled);
    assert_eq!(config.remote.instance_name, "main");
    assert_eq!(config.remote.max_batch_digests, 100);
    assert_eq!(config.gc.size_budget, 1024 * 1024 * 1024);
    // Unspecified values keep their defaults
    assert!(config.local.use_mmap);
    assert_eq!(config.remote.chunk_size, 1024 * 1024);
}

/// Test config hierarchy: a project section replaces the global section
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[local]
root = "/global/store"
shard_count = 8

[gc]
size_budget = 1000
"#,
    )
    .unwrap();

    let project = temp.path().join("project.toml");
    std::fs::write(
        &project,
        r#"
[local]
root = "/project/store"
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(&global), Some(&project)).unwrap();

    // [local] replaced wholesale by the project section
    assert_eq!(config.local.root, PathBuf::from("/project/store"));
    assert_eq!(config.local.shard_count, 16);
    // [gc] preserved from global
    assert_eq!(config.gc.size_budget, 1000);
}

/// Test missing files fall back to defaults
#[test]
fn test_missing_files_use_defaults() {
    let temp = tempdir().unwrap();
    let config = Config::load_from(
        Some(&temp.path().join("absent.toml")),
        Some(&temp.path().join("also-absent.toml")),
    )
    .unwrap();
    assert_eq!(config.local.large_blob_threshold, 512 * 1024);
}

/// Test an invalid file is rejected at load time
#[test]
fn test_invalid_values_rejected() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("store.toml");
    std::fs::write(
        &global,
        r#"
[local]
large_blob_threshold = 0
"#,
    )
    .unwrap();

    let err = Config::load_from(Some(&global), None).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "local.large_blob_threshold",
            ..
        }
    ));
}

/// Test malformed TOML surfaces a parse error
#[test]
fn test_malformed_toml() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("store.toml");
    std::fs::write(&global, "[local\nroot = ").unwrap();
    assert!(matches!(
        Config::load_from(Some(&global), None),
        Err(ConfigError::Toml(_))
    ));
}

/// Test config with environment variable override
#[test]
fn test_config_env_override_integration() {
    std::env::set_var("VRIFT_REMOTE_RETRIES", "9");
    let config = Config::load_from(None, None);
    std::env::remove_var("VRIFT_REMOTE_RETRIES");

    assert_eq!(config.unwrap().remote.retries, 9);
}

/// Test complete config serialization/deserialization cycle
#[test]
fn test_config_full_roundtrip_with_all_sections() {
    let mut original = Config::default();
    original.local.shard_count = 64;
    original.remote.enabled = true;
    original.gc.target_ratio = 0.5;

    let temp = tempdir().unwrap();
    let config_path = temp.path().join("store.toml");
    std::fs::write(&config_path, toml::to_string_pretty(&original).unwrap()).unwrap();

    let contents = std::fs::read_to_string(&config_path).unwrap();
    let loaded: Config = toml::from_str(&contents).unwrap();
    assert_eq!(original, loaded);
}
