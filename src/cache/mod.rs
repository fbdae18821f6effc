mod codec;
mod error;
mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod traits;

use std::sync::Arc;

// Public API exports
pub use codec::{decode_key, encode_key};
pub use error::{CacheError, CacheResult};
pub use keys::{CacheKeys, Period};
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis::RedisCache;
pub use traits::{Cache, WindowCounters};

use crate::config::CacheConfig;

/// Build a cache client from configuration.
///
/// Constructed once at process start and injected into the engine; no
/// module-level singletons.
pub fn build_cache(config: &CacheConfig) -> CacheResult<Arc<dyn Cache>> {
    match config {
        CacheConfig::Memory(memory) => Ok(Arc::new(MemoryCache::new(memory))),
        #[cfg(feature = "redis")]
        CacheConfig::Redis(redis) => Ok(Arc::new(RedisCache::from_config(redis)?)),
        #[cfg(not(feature = "redis"))]
        CacheConfig::Redis(_) => Err(CacheError::Internal(
            "redis cache configured but the 'redis' feature is disabled".to_string(),
        )),
    }
}
