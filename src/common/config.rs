//! Configuration for the multi-update coordinator

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (e.g. `MULTIUPDATE_NODE_ID`)
pub const ENV_PREFIX: &str = "MULTIUPDATE";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "coord-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `MULTIUPDATE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.coordinator.validate()?;
        Ok(config)
    }
}

/// How a resubmitted operation is recognised as a duplicate of a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateRule {
    /// Same operation id.
    OperationId,
    /// Same namespace, command and session context.
    #[default]
    Content,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for coordinator documents
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Shard endpoints receiving the update broadcast
    #[serde(default)]
    pub shards: Vec<String>,

    /// Endpoint of the migration control plane
    #[serde(default = "default_config_server")]
    pub config_server: String,

    /// First backoff between document write retries
    #[serde(default = "default_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    /// Backoff ceiling between document write retries
    #[serde(default = "default_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Poll interval while waiting for pending updates to drain
    #[serde(default = "default_pending_check_interval")]
    pub pending_check_interval_ms: u64,

    /// Timeout for a single gateway request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Delay before a coordinator that failed fatally is rebuilt from its
    /// stored document
    #[serde(default = "default_reconstruct_backoff")]
    pub reconstruct_backoff_ms: u64,

    /// Maximum number of coordinator instances running at once
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,

    /// Duplicate detection for resubmitted operations
    #[serde(default)]
    pub duplicate_rule: DuplicateRule,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./coord-data")
}
fn default_config_server() -> String {
    "http://localhost:7100".to_string()
}
fn default_initial_backoff() -> u64 {
    10
}
fn default_max_backoff() -> u64 {
    1_000
}
fn default_pending_check_interval() -> u64 {
    50
}
fn default_request_timeout() -> u64 {
    30_000
}
fn default_reconstruct_backoff() -> u64 {
    5_000
}
fn default_max_concurrent_instances() -> usize {
    8
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            shards: Vec::new(),
            config_server: default_config_server(),
            retry_initial_backoff_ms: default_initial_backoff(),
            retry_max_backoff_ms: default_max_backoff(),
            pending_check_interval_ms: default_pending_check_interval(),
            request_timeout_ms: default_request_timeout(),
            reconstruct_backoff_ms: default_reconstruct_backoff(),
            max_concurrent_instances: default_max_concurrent_instances(),
            duplicate_rule: DuplicateRule::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_instances == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_concurrent_instances must be at least 1".into(),
            ));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "retry_initial_backoff_ms ({}) exceeds retry_max_backoff_ms ({})",
                self.retry_initial_backoff_ms, self.retry_max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }

    pub fn pending_check_interval(&self) -> Duration {
        Duration::from_millis(self.pending_check_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconstruct_backoff(&self) -> Duration {
        Duration::from_millis(self.reconstruct_backoff_ms)
    }
}

/// Backoff bounds for majority-commit write retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        CoordinatorConfig::default().retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.duplicate_rule, DuplicateRule::Content);
        assert_eq!(config.retry_policy().initial_backoff, Duration::from_millis(10));
        assert_eq!(config.reconstruct_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "coord-7"

[coordinator]
shards = ["http://shard-a:8000", "http://shard-b:8000"]
max_concurrent_instances = 2
duplicate_rule = "operation_id"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "coord-7");
        assert_eq!(config.coordinator.shards.len(), 2);
        assert_eq!(config.coordinator.max_concurrent_instances, 2);
        assert_eq!(config.coordinator.duplicate_rule, DuplicateRule::OperationId);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let config = CoordinatorConfig {
            retry_initial_backoff_ms: 5_000,
            retry_max_backoff_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
