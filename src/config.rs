//! Configuration management.
//!
//! dagr configuration can come from:
//! - Environment variables (DAGR_*)
//! - Config file (~/.config/dagr/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the job worker pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Attempts per node before its failure becomes terminal.
    #[serde(default = "default_retry_attempts")]
    pub default_retry_attempts: u32,

    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Cap on the backoff delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Deadline for a single node execution unless the node overrides it.
    #[serde(default = "default_node_timeout_ms")]
    pub node_default_timeout_ms: u64,

    /// How long shutdown waits for in-flight jobs before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            node_default_timeout_ms: default_node_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_node_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database. `None` selects the default data
    /// directory; tests use in-memory storage instead.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Durable backlog size above which `enqueue` blocks callers.
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: u64,

    /// Worker poll interval when the queue is idle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backlog_limit: default_backlog_limit(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_backlog_limit() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl EngineConfig {
    /// Load configuration from the default file location plus env overrides.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("dagr"))
            .unwrap_or_else(|| PathBuf::from(".dagr"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("dagr"))
            .unwrap_or_else(|| PathBuf::from(".dagr"))
    }

    /// Resolved database path (default data dir when unset).
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("dagr.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DAGR_MAX_CONCURRENCY") {
            if let Ok(parsed) = v.parse::<usize>() {
                self.max_concurrency = parsed;
            }
        }
        if let Ok(v) = std::env::var("DAGR_RETRY_ATTEMPTS") {
            if let Ok(parsed) = v.parse::<u32>() {
                self.default_retry_attempts = parsed;
            }
        }
        if let Ok(v) = std::env::var("DAGR_RETRY_BASE_DELAY_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.retry_base_delay_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("DAGR_NODE_TIMEOUT_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.node_default_timeout_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("DAGR_SHUTDOWN_GRACE_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.shutdown_grace_ms = parsed;
            }
        }
        if let Ok(path) = std::env::var("DAGR_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(v) = std::env::var("DAGR_QUEUE_BACKLOG_LIMIT") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.queue.backlog_limit = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(v) = partial.max_concurrency {
            self.max_concurrency = v;
        }
        if let Some(v) = partial.default_retry_attempts {
            self.default_retry_attempts = v;
        }
        if let Some(v) = partial.retry_base_delay_ms {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = partial.retry_max_delay_ms {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = partial.node_default_timeout_ms {
            self.node_default_timeout_ms = v;
        }
        if let Some(v) = partial.shutdown_grace_ms {
            self.shutdown_grace_ms = v;
        }
        if let Some(v) = partial.storage {
            self.storage = v;
        }
        if let Some(v) = partial.queue {
            self.queue = v;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    max_concurrency: Option<usize>,
    default_retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    node_default_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    storage: Option<StorageConfig>,
    queue: Option<QueueConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.default_retry_attempts, 3);
        assert_eq!(config.queue.backlog_limit, 10_000);
    }

    #[test]
    fn test_partial_toml() {
        let partial: PartialConfig =
            toml::from_str("max_concurrency = 16\n[queue]\nbacklog_limit = 42").unwrap();
        let mut config = EngineConfig::default();
        config.apply_partial(partial);
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.queue.backlog_limit, 42);
        // untouched fields keep defaults
        assert_eq!(config.default_retry_attempts, 3);
    }
}
