use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Hot counter cache configuration.
///
/// The cache carries the authentication index, the key-record mirror, cost
/// buckets, rate windows, and usage logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CacheConfig {
    /// In-memory cache. Good for single-node deployments.
    /// Data is lost on restart. Not suitable for multi-node.
    Memory(MemoryCacheConfig),

    /// Redis cache. Required for multi-node deployments.
    Redis(RedisCacheConfig),
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory(MemoryCacheConfig::default())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            CacheConfig::Memory(c) => c.validate(),
            CacheConfig::Redis(c) => c.validate(),
        }
    }
}

/// In-memory cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries in the byte-value store.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Number of entries to evict when the cache is full.
    /// Eviction removes expired entries first, then uses LRU.
    #[serde(default = "default_eviction_batch_size")]
    pub eviction_batch_size: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            eviction_batch_size: default_eviction_batch_size(),
        }
    }
}

impl MemoryCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "Memory cache max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_eviction_batch_size() -> usize {
    100
}

/// Redis cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisCacheConfig {
    /// Redis connection URL.
    /// Format: redis://[user:password@]host:port[/database]
    pub url: String,

    /// Connection timeout in seconds.
    #[serde(default = "default_redis_timeout")]
    pub connect_timeout_secs: u64,

    /// Prefix prepended to every cache key.
    /// Useful when sharing a Redis instance with other applications.
    #[serde(default)]
    pub key_prefix: String,
}

impl RedisCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation("Redis URL cannot be empty".into()));
        }
        Ok(())
    }
}

fn default_redis_timeout() -> u64 {
    5
}
