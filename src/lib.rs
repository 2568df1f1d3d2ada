//! gencache - Generation-based query result cache
//!
//! Query results are cached under keys derived from a per-table generation
//! token. A write replaces the generation of every table it touches, which
//! makes every earlier result over those tables unreachable at once:
//! - Table and multi-table generations live in a shared cache backend
//! - Writes inside a transaction stay private until commit, with savepoints
//! - Reads fail open when the shared cache is unreachable; invalidation fails loud
//! - The host wires reads and writes in through an explicit [`Interceptor`]
//!
//! Every call takes a [`CacheContext`] owned by the current unit of work.
//! Call [`CacheContext::clear`] when the unit of work ends.

pub mod backend;
mod config;
pub mod engine;
mod error;
pub mod events;
pub mod generation;
pub mod intercept;
pub mod keys;
pub mod overlay;
pub mod schema;

#[cfg(test)]
mod testing;

pub use backend::{
    MemoryCache, MemoryCacheConfig, RedisCache, RedisCacheConfig, SharedCache, THIRTY_DAYS,
};
pub use config::{CacheConfig, OversizePolicy};
pub use engine::{Cacheable, EntityWrite, Fetched, QueryCache, QueryOutput, RowStream};
pub use error::{BoxError, CacheError};
pub use events::{CacheEvent, EventSink, TracingSink, describe_metrics};
pub use generation::GenerationStore;
pub use intercept::{Interceptor, QueryExecutor, TableResolver};
pub use keys::{KeyGenerator, KeyPart, QueryFingerprint, ResultShape};
pub use overlay::{CacheContext, TransactionalOverlay};
pub use schema::{RelationSchema, StaticSchema};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
