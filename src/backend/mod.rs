//! Shared cache backends
//!
//! The shared cache is the committed state every process sees. It only needs
//! per-key `get`/`set` with a TTL; nothing here relies on multi-key atomicity.

mod memory_cache;
mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;

pub use memory_cache::{MemoryCache, MemoryCacheConfig};
pub use redis_cache::{RedisCache, RedisCacheConfig};

/// Largest TTL memcached-style backends accept before treating it as a timestamp.
pub const THIRTY_DAYS: Duration = Duration::from_secs(2_591_999);

/// A key/value store shared by every process that must agree on invalidation.
#[async_trait]
pub trait SharedCache: Send + Sync + 'static {
    /// Fetch a value. `Ok(None)` means absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value for at most `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Longest TTL this backend can represent. Used when no TTL is configured.
    fn max_ttl(&self) -> Duration {
        THIRTY_DAYS
    }
}

/// Clamp a configured TTL to what `backend` supports; `None` means the maximum.
pub(crate) fn effective_ttl<B: SharedCache + ?Sized>(
    configured: Option<Duration>,
    backend: &B,
) -> Duration {
    let max = backend.max_ttl();
    configured.map_or(max, |ttl| ttl.min(max))
}

pub(crate) fn check_value_size(
    key: &str,
    value: &str,
    limit: Option<usize>,
) -> Result<(), CacheError> {
    match limit {
        Some(limit) if value.len() > limit => Err(CacheError::Oversized {
            key: key.to_owned(),
            size: value.len(),
            limit,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_zero_maps_to_backend_maximum() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());
        assert_eq!(effective_ttl(None, &cache), THIRTY_DAYS);
        assert_eq!(
            effective_ttl(Some(Duration::from_secs(60)), &cache),
            Duration::from_secs(60)
        );
        assert_eq!(
            effective_ttl(Some(Duration::from_secs(u64::MAX)), &cache),
            THIRTY_DAYS
        );
    }

    #[test]
    fn value_size_limit() {
        assert!(check_value_size("k", "abc", None).is_ok());
        assert!(check_value_size("k", "abc", Some(3)).is_ok());
        assert!(matches!(
            check_value_size("k", "abcd", Some(3)),
            Err(CacheError::Oversized { size: 4, limit: 3, .. })
        ));
    }
}
