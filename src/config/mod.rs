//! Application configuration.
//!
//! Aggregates storage, stream and consumer settings into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod consumer;
mod storage;

pub use consumer::{AckPolicy, ConsumerConfig, StreamConfig};
pub use storage::{RedisConfig, StorageConfig, StorageType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTLOG_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTLOG";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTLOG_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Stream key layout.
    pub streams: StreamConfig,
    /// Consumer-group settings.
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store and consumer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let redis = &self.storage.redis;
        if redis.use_pooling && redis.max_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "storage.redis.max_pool_size must be at least 1 when pooling".to_string(),
            ));
        }
        if redis.use_pooling && redis.min_pool_size > redis.max_pool_size {
            return Err(ConfigError::Invalid(format!(
                "storage.redis.min_pool_size ({}) exceeds max_pool_size ({})",
                redis.min_pool_size, redis.max_pool_size
            )));
        }
        if self.streams.read_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "streams.read_batch_size must be positive".to_string(),
            ));
        }
        if self.consumer.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "consumer.max_batch_size must be positive".to_string(),
            ));
        }
        if self.consumer.consumer_group.is_empty() {
            return Err(ConfigError::Invalid(
                "consumer.consumer_group must not be empty".to_string(),
            ));
        }
        if self.consumer.consumer_name.is_empty() {
            return Err(ConfigError::Invalid(
                "consumer.consumer_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Config backed by the in-memory log, for tests and embedded use.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
