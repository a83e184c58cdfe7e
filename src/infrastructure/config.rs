//! Orchestrator configuration: loaded from layered sources (programmatic
//! defaults, `orchestrator.yaml`, `ORCHESTRATOR_*` env vars) and validated
//! eagerly, mirroring the teacher's `infrastructure/config::ConfigLoader`.

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::logging::LogConfig;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid worker_count: {0}. Must be between 1 and 256")]
    InvalidWorkerCount(usize),

    #[error("invalid heartbeat_ttl_secs: {0}. Must be positive")]
    InvalidHeartbeatTtl(i64),

    #[error("invalid visibility_timeout_secs: {0}. Must be positive")]
    InvalidVisibilityTimeout(u64),

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("database path cannot be empty")]
    EmptyDatabasePath,

    #[error("invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error(
        "invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("failed to extract configuration: {0}")]
    Figment(#[from] figment::Error),
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub worker: WorkerConfig,
    pub broker: BrokerConfig,
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub logging: LogConfig,
}

/// How many scheduling workers to run per job-type pool (spec.md §4.3: a
/// flood of system evals must not starve service scheduling).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub service_batch_workers: usize,
    pub system_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_batch_workers: 4,
            system_workers: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub visibility_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 60,
        }
    }
}

/// Node liveness parameters (spec.md: heartbeat TTL before `ready -> down`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub heartbeat_ttl_secs: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".clusterd/state.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Backoff parameters for [`crate::services::plan_applier::PlanApplier`]'s
/// retry of transient `StateStoreError::TxnConflict`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 20,
            max_backoff_ms: 500,
            max_elapsed_secs: 5,
        }
    }
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (`Serialized`)
    /// 2. `orchestrator.yaml` (optional)
    /// 3. Environment variables (`ORCHESTRATOR_` prefix, highest priority)
    pub fn load() -> Result<OrchestratorConfig, ConfigError> {
        let config: OrchestratorConfig = Figment::new()
            .merge(Serialized::defaults(OrchestratorConfig::default()))
            .merge(Yaml::file("orchestrator.yaml"))
            .merge(Env::prefixed("ORCHESTRATOR_").split("__"))
            .extract()?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, skipping env overrides.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<OrchestratorConfig, ConfigError> {
        let config: OrchestratorConfig = Figment::new()
            .merge(Serialized::defaults(OrchestratorConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &OrchestratorConfig) -> Result<(), ConfigError> {
        if config.worker.service_batch_workers == 0 || config.worker.service_batch_workers > 256 {
            return Err(ConfigError::InvalidWorkerCount(config.worker.service_batch_workers));
        }
        if config.worker.system_workers == 0 || config.worker.system_workers > 256 {
            return Err(ConfigError::InvalidWorkerCount(config.worker.system_workers));
        }
        if config.node.heartbeat_ttl_secs <= 0 {
            return Err(ConfigError::InvalidHeartbeatTtl(config.node.heartbeat_ttl_secs));
        }
        if config.broker.visibility_timeout_secs == 0 {
            return Err(ConfigError::InvalidVisibilityTimeout(config.broker.visibility_timeout_secs));
        }
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(config.retry.initial_backoff_ms, config.retry.max_backoff_ms));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = OrchestratorConfig::default();
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = OrchestratorConfig::default();
        config.worker.service_batch_workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWorkerCount(0))
        ));
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = OrchestratorConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidLogLevel(_))));
    }

    #[test]
    fn backoff_ordering_enforced() {
        let mut config = OrchestratorConfig::default();
        config.retry.initial_backoff_ms = 1000;
        config.retry.max_backoff_ms = 500;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidBackoff(1000, 500))));
    }

    #[test]
    fn yaml_override_wins() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker:\n  service_batch_workers: 8\nlogging:\n  level: debug").unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).expect("should load");
        assert_eq!(config.worker.service_batch_workers, 8);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.worker.system_workers, 1, "unset fields keep their default");
    }
}
