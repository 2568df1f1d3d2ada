//! In-process shared cache on Moka.
//!
//! Only "shared" between the callers of one process, which is what tests and
//! single-process deployments need.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

use super::{SharedCache, check_value_size};
use crate::CacheError;

/// Configuration for [`MemoryCache`]
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries
    pub max_capacity: u64,
    /// Reject values larger than this many bytes
    pub max_value_bytes: Option<usize>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            max_value_bytes: None,
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: Arc<str>,
    ttl: Duration,
}

/// Each entry lives for the TTL it was written with; a rewrite restarts it.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Moka-backed [`SharedCache`]. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<String, Entry>,
    max_value_bytes: Option<usize>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            entries,
            max_value_bytes: config.max_value_bytes,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).await.map(|e| e.value.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        check_value_size(key, &value, self.max_value_bytes)?;
        debug!(key, ttl_secs = ttl.as_secs(), "memory cache set");
        self.entries
            .insert(
                key.to_owned(),
                Entry {
                    value: value.into(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryCache::default();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "v1".to_owned(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v1"));

        cache.set("k", "v2".to_owned(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let a = MemoryCache::default();
        let b = a.clone();
        a.set("k", "v".to_owned(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::default();
        cache.set("k", "v".to_owned(), Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_oversized_values() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_value_bytes: Some(4),
            ..Default::default()
        });
        let err = cache
            .set("k", "too long".to_owned(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Oversized { .. }));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
