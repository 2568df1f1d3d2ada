//! Observability events for the read path.
//!
//! Every cached read produces exactly one of hit, miss or skipped. Events are
//! for logging and metrics only; nothing depends on them for correctness.

use std::sync::Once;

use metrics::{Unit, counter, describe_counter};
use tracing::debug;

pub const METRIC_HIT: &str = "gencache_query_hit_total";
pub const METRIC_MISS: &str = "gencache_query_miss_total";
pub const METRIC_SKIP: &str = "gencache_query_skip_total";
pub const METRIC_INVALIDATION: &str = "gencache_invalidation_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Outcome of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Served from the overlay or shared cache.
    Hit {
        tables: Vec<String>,
        query: String,
        key: String,
        /// Rows in the cached result
        size: usize,
    },
    /// Not cached yet; the executor ran and the result was stored.
    Miss {
        tables: Vec<String>,
        query: String,
        key: String,
    },
    /// Caching did not apply: no tables, a disallowed table, a disabled
    /// engine, or table generations that could not be read. A result key
    /// that could not be read is a [`CacheEvent::Miss`].
    Skipped {
        tables: Vec<String>,
        query: String,
        key: Option<String>,
    },
}

impl CacheEvent {
    pub fn outcome(&self) -> &'static str {
        match self {
            CacheEvent::Hit { .. } => "hit",
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::Skipped { .. } => "skipped",
        }
    }
}

/// Receives read events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &CacheEvent);
}

/// Default sink: a `tracing` debug record and a counter per outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Hit {
                tables,
                query,
                key,
                size,
            } => {
                debug!(?tables, query, key, size, "query cache hit");
                counter!(METRIC_HIT).increment(1);
            }
            CacheEvent::Miss { tables, query, key } => {
                debug!(?tables, query, key, "query cache miss");
                counter!(METRIC_MISS).increment(1);
            }
            CacheEvent::Skipped { tables, query, key } => {
                debug!(?tables, query, ?key, "query cache skipped");
                counter!(METRIC_SKIP).increment(1);
            }
        }
    }
}

/// Register descriptions for the counters this crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_HIT, Unit::Count, "Reads served from the query cache.");
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Cacheable reads that had to run the query."
        );
        describe_counter!(
            METRIC_SKIP,
            Unit::Count,
            "Reads that bypassed the query cache."
        );
        describe_counter!(
            METRIC_INVALIDATION,
            Unit::Count,
            "Table generations replaced by writes."
        );
    });
}
