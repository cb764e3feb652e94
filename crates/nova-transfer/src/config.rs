use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overrides `chunk_size` when set.
pub const CHUNK_SIZE_ENV_VAR: &str = "NOVA_TRANSFER_CHUNK_SIZE";
/// Overrides `pool.max_threads` when set.
pub const MAX_THREADS_ENV_VAR: &str = "NOVA_TRANSFER_MAX_THREADS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Maximum payload bytes per outbound chunk.
    #[serde(default = "TransferConfig::default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub pool: WorkerPoolConfig,
}

impl TransferConfig {
    fn default_chunk_size() -> usize {
        64 * 1024
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: Self::default_chunk_size(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

/// Sizing of the per-connection pull worker pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerPoolConfig {
    /// Maximum number of pull handlers running concurrently.
    #[serde(default = "WorkerPoolConfig::default_max_threads")]
    pub max_threads: usize,

    /// Maximum number of pull requests waiting for a worker. Beyond this, and with every worker
    /// busy, the dispatch thread runs the pull itself.
    #[serde(default = "WorkerPoolConfig::default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long an idle worker thread lingers before exiting.
    #[serde(default = "WorkerPoolConfig::default_keep_alive_ms")]
    pub keep_alive_ms: u64,
}

impl WorkerPoolConfig {
    fn default_max_threads() -> usize {
        10
    }

    fn default_queue_capacity() -> usize {
        10
    }

    fn default_keep_alive_ms() -> u64 {
        60_000
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_threads: Self::default_max_threads(),
            queue_capacity: Self::default_queue_capacity(),
            keep_alive_ms: Self::default_keep_alive_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep just the message: the default `Display` includes a snippet of the input.
        ConfigError::Toml(err.message().to_string())
    }
}

impl TransferConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.pool.max_threads == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply `NOVA_TRANSFER_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = parse_override(&lookup, CHUNK_SIZE_ENV_VAR)? {
            self.chunk_size = value;
        }
        if let Some(value) = parse_override(&lookup, MAX_THREADS_ENV_VAR)? {
            self.pool.max_threads = value;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_override(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<usize>()
        .map(Some)
        .map_err(|err| ConfigError::Invalid(format!("invalid {var}={raw:?}: {err}")))
}
