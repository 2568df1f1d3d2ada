//! Cache configuration

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_KEY_PREFIX: &str = "jc";

/// What to do when the backend rejects a value for being too large.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    /// Surface the failure to the caller.
    #[default]
    Propagate,
    /// Log a warning and carry on without storing the value.
    Ignore,
}

/// Configuration for the query cache
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether reads are cached and writes invalidate at startup
    pub enabled: bool,
    /// Prefix for every key this cache writes
    pub key_prefix: String,
    /// TTL for generations and cached results, in seconds. 0 means the backend maximum.
    pub ttl_secs: u64,
    /// Tables whose queries are never cached
    pub blacklist: BTreeSet<String>,
    /// If non-empty, only queries touching exclusively these tables are cached
    pub whitelist: BTreeSet<String>,
    /// Database alias -> generation namespace. Aliases mapped to the same
    /// namespace share table generations.
    pub db_cache_keys: HashMap<String, String>,
    /// Behavior when a value is too large for the backend
    pub oversize_policy: OversizePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            ttl_secs: 0,
            blacklist: BTreeSet::new(),
            whitelist: BTreeSet::new(),
            db_cache_keys: HashMap::new(),
            oversize_policy: OversizePolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Configured TTL, or `None` when the backend maximum should be used.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    /// Generation namespace for a database alias. Unmapped aliases are their own namespace.
    pub fn cache_key_for<'a>(&'a self, db: &'a str) -> &'a str {
        self.db_cache_keys.get(db).map(String::as_str).unwrap_or(db)
    }

    /// True if a query over `tables` must not be cached.
    ///
    /// A non-empty whitelist wins over the blacklist.
    pub fn is_disallowed<'t, I>(&self, tables: I) -> bool
    where
        I: IntoIterator<Item = &'t str>,
    {
        let mut tables = tables.into_iter();
        if !self.whitelist.is_empty() {
            tables.any(|t| !self.whitelist.contains(t))
        } else {
            tables.any(|t| self.blacklist.contains(t))
        }
    }
}
