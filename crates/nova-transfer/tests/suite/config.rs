use std::time::Duration;

use nova_transfer::{ConfigError, TransferConfig, WorkerPoolConfig};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

#[test]
fn empty_config_uses_defaults() {
    let config = TransferConfig::load_from_str("").unwrap();
    assert_eq!(config, TransferConfig::default());
    assert_eq!(config.chunk_size, 64 * 1024);
    assert_eq!(config.pool.max_threads, 10);
    assert_eq!(config.pool.queue_capacity, 10);
    assert_eq!(config.pool.keep_alive(), Duration::from_secs(60));
}

#[test]
fn loads_config_from_toml_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("transfer.toml");
    std::fs::write(
        &path,
        r#"
chunk_size = 1000

[pool]
max_threads = 2
keep_alive_ms = 500
"#,
    )
    .unwrap();

    let config = TransferConfig::load_from_path(&path).unwrap();
    assert_eq!(
        config,
        TransferConfig {
            chunk_size: 1000,
            pool: WorkerPoolConfig {
                max_threads: 2,
                queue_capacity: 10,
                keep_alive_ms: 500,
            },
        }
    );
}

#[test]
fn missing_file_reports_the_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.toml");
    let err = TransferConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }), "{err}");
    assert!(err.to_string().contains("missing.toml"), "{err}");
}

#[test]
fn unknown_keys_are_rejected() {
    let err = TransferConfig::load_from_str("chunk_bytes = 10\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err}");
    assert!(err.to_string().contains("chunk_bytes"), "{err}");
}

#[test]
fn zero_sizes_are_invalid() {
    let err = TransferConfig::load_from_str("chunk_size = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err}");

    let err = TransferConfig::load_from_str("[pool]\nmax_threads = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
}
