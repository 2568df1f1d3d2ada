//! Redis shared cache

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use super::{SharedCache, check_value_size};
use crate::CacheError;

/// Configuration for [`RedisCache`]
#[derive(Debug, Clone, Default)]
pub struct RedisCacheConfig {
    /// Reject values larger than this many bytes before they reach Redis
    pub max_value_bytes: Option<usize>,
}

/// [`SharedCache`] over a Redis connection manager.
///
/// Redis has no eviction besides TTLs, so every write carries one; the
/// configured "forever" is capped at thirty days.
#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    config: RedisCacheConfig,
}

impl RedisCache {
    pub async fn new(
        redis_client: redis::Client,
        config: RedisCacheConfig,
    ) -> Result<Self, redis::RedisError> {
        let conn = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { conn, config })
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value = conn.get::<_, Option<String>>(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        check_value_size(key, &value, self.config.max_value_bytes)?;
        // SETEX rejects 0
        let ttl_seconds = ttl.as_secs().max(1);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        debug!(key, ttl_seconds, "redis SETEX");
        Ok(())
    }
}
