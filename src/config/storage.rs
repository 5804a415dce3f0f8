//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Redis,
    Memory,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index.
    pub database: i64,
    pub connection_timeout_ms: u64,
    /// Response timeout for non-blocking commands.
    pub read_timeout_ms: u64,
    /// When false a single connection is shared by all callers.
    pub use_pooling: bool,
    /// Connections that must be established at startup.
    pub min_pool_size: usize,
    /// Upper bound on pooled connections.
    pub max_pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            database: 0,
            connection_timeout_ms: 2000,
            read_timeout_ms: 2000,
            use_pooling: true,
            min_pool_size: 2,
            max_pool_size: 8,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Connection parameters for the Redis client.
    #[cfg(feature = "redis")]
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.database,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}
