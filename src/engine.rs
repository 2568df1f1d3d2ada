//! Generation-based query cache
//!
//! Reads are cached under a key derived from the generation of every table
//! they touch; writes replace the generation of every table they touch. A
//! write therefore makes every earlier result over that table unreachable
//! without knowing which results exist.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::TryStreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, error, info, warn};

use crate::backend::SharedCache;
use crate::events::{CacheEvent, EventSink, METRIC_INVALIDATION, TracingSink};
use crate::generation::GenerationStore;
use crate::keys::{KeyGenerator, QueryFingerprint};
use crate::overlay::{CacheContext, TransactionalOverlay};
use crate::schema::RelationSchema;
use crate::{BoxError, CacheConfig, CacheError};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Rows produced lazily by an executor.
pub type RowStream<T> = BoxStream<'static, Result<T, BoxError>>;

/// What an executor hands back.
pub enum Fetched<T> {
    Rows(Vec<T>),
    /// Drained into a `Vec` before caching
    Stream(RowStream<T>),
    Row(Option<T>),
}

impl<T> Fetched<T> {
    /// Collect into a [`QueryOutput`], draining a stream if there is one.
    pub async fn materialize(self) -> Result<QueryOutput<T>, BoxError> {
        match self {
            Fetched::Rows(rows) => Ok(QueryOutput::Rows(rows)),
            Fetched::Stream(stream) => Ok(QueryOutput::Rows(stream.try_collect().await?)),
            Fetched::Row(row) => Ok(QueryOutput::Row(row)),
        }
    }
}

impl<T> From<Vec<T>> for Fetched<T> {
    fn from(rows: Vec<T>) -> Self {
        Fetched::Rows(rows)
    }
}

/// A materialized result, as cached and as returned to callers.
///
/// Empty results are cached like any other: `Rows(vec![])` and `Row(None)`
/// are hits, distinct from a key that is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOutput<T> {
    Rows(Vec<T>),
    Row(Option<T>),
}

impl<T> QueryOutput<T> {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Rows(rows) => rows.len(),
            QueryOutput::Row(row) => usize::from(row.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_rows(self) -> Vec<T> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Row(row) => row.into_iter().collect(),
        }
    }
}

/// What kind of entity write happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityWrite {
    Saved,
    /// Also invalidates tables that reference the deleted entity's table
    Deleted,
}

/// The query cache engine. Cheap to clone; clones share state.
///
/// Construct one per process and hand clones to every call site.
pub struct QueryCache<B: SharedCache> {
    inner: Arc<QueryCacheInner<B>>,
}

struct QueryCacheInner<B: SharedCache> {
    config: CacheConfig,
    keygen: KeyGenerator,
    overlay: Arc<TransactionalOverlay<B>>,
    generations: GenerationStore<B>,
    enabled: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl<B: SharedCache> Clone for QueryCache<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: SharedCache> QueryCache<B> {
    /// Create an engine logging events through `tracing` and `metrics`.
    pub fn new(backend: B, config: CacheConfig) -> Self {
        Self::with_sink(backend, config, Arc::new(TracingSink))
    }

    pub fn with_sink(backend: B, config: CacheConfig, sink: Arc<dyn EventSink>) -> Self {
        let keygen = KeyGenerator::new(config.clone());
        let overlay = Arc::new(TransactionalOverlay::new(Arc::new(backend), &config));
        let generations = GenerationStore::new(Arc::clone(&overlay), keygen.clone());
        Self {
            inner: Arc::new(QueryCacheInner {
                enabled: AtomicBool::new(config.enabled),
                config,
                keygen,
                overlay,
                generations,
                sink,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn keygen(&self) -> &KeyGenerator {
        &self.inner.keygen
    }

    /// The transaction overlay; hosts mirror their transaction lifecycle here.
    pub fn overlay(&self) -> &TransactionalOverlay<B> {
        &self.inner.overlay
    }

    pub fn generations(&self) -> &GenerationStore<B> {
        &self.inner.generations
    }

    /// Turn caching and invalidation on for the whole process. Idempotent.
    pub fn enable(&self) {
        if !self.inner.enabled.swap(true, Ordering::SeqCst) {
            info!("query cache enabled");
        }
    }

    /// Turn caching and invalidation off for the whole process. Idempotent.
    ///
    /// Writes made while disabled do not invalidate anything.
    pub fn disable(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            warn!("query cache disabled; writes will not invalidate cached results");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Return the cached result of `query` over `tables`, or run `execute`
    /// and cache what it returns.
    ///
    /// Executor errors come back as [`CacheError::Executor`] holding the
    /// original error. Failing to read the cache is never an error: the
    /// query just runs uncached. An unreadable result key is reported as a
    /// miss; unreadable generations leave no key to report, so that read is
    /// reported as skipped.
    pub async fn lookup_or_compute<T, F, Fut>(
        &self,
        ctx: &mut CacheContext,
        tables: &BTreeSet<String>,
        db: &str,
        query: &QueryFingerprint,
        execute: F,
    ) -> Result<QueryOutput<T>, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<T>, BoxError>>,
    {
        let table_list: Vec<String> = tables.iter().cloned().collect();

        if !self.is_enabled()
            || tables.is_empty()
            || self.inner.config.is_disallowed(tables.iter().map(String::as_str))
        {
            self.emit(CacheEvent::Skipped {
                tables: table_list,
                query: query.text.clone(),
                key: None,
            });
            return run(execute).await;
        }

        let key = match self.result_key(ctx, tables, db, query).await {
            Ok(key) => key,
            Err(e) => {
                warn!(db, error = %e, "could not read table generations, running uncached");
                self.emit(CacheEvent::Skipped {
                    tables: table_list,
                    query: query.text.clone(),
                    key: None,
                });
                return run(execute).await;
            }
        };

        match self.inner.overlay.get(ctx, db, &key).await {
            Ok(Some(payload)) => match serde_json::from_str::<QueryOutput<T>>(&payload) {
                Ok(output) => {
                    self.emit(CacheEvent::Hit {
                        tables: table_list,
                        query: query.text.clone(),
                        key,
                        size: output.len(),
                    });
                    return Ok(output);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "undecodable cached result, recomputing");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, running uncached");
                self.emit(CacheEvent::Miss {
                    tables: table_list,
                    query: query.text.clone(),
                    key,
                });
                return run(execute).await;
            }
        }

        self.emit(CacheEvent::Miss {
            tables: table_list,
            query: query.text.clone(),
            key: key.clone(),
        });

        let output = run(execute).await?;
        let payload = serde_json::to_string(&output)?;
        match self.inner.overlay.set(ctx, db, &key, payload).await {
            Ok(()) => {}
            Err(e) if e.is_backend_unavailable() => {
                warn!(key = %key, error = %e, "could not store query result");
            }
            Err(e) => return Err(e),
        }
        Ok(output)
    }

    /// Replace the generation of every table in `tables`.
    ///
    /// Every table is attempted; the first failure is returned. A failure
    /// here means stale results stay reachable, so it is never swallowed.
    pub async fn invalidate<I, S>(
        &self,
        ctx: &mut CacheContext,
        tables: I,
        db: &str,
    ) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.is_enabled() {
            debug!(db, "query cache disabled, invalidation skipped");
            return Ok(());
        }

        let tables: BTreeSet<String> = tables
            .into_iter()
            .map(|t| t.as_ref().to_owned())
            .collect();
        let mut first_error = None;
        for table in &tables {
            match self.inner.generations.invalidate(ctx, table, db).await {
                Ok(_) => counter!(METRIC_INVALIDATION).increment(1),
                Err(e) => {
                    error!(table = %table, db, error = %e, "table invalidation failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Invalidate after an entity of `table` was saved or deleted.
    pub async fn on_entity_write<S>(
        &self,
        ctx: &mut CacheContext,
        schema: &S,
        table: &str,
        write: EntityWrite,
        db: &str,
    ) -> Result<(), CacheError>
    where
        S: RelationSchema + ?Sized,
    {
        let mut tables = BTreeSet::from([table.to_owned()]);
        if write == EntityWrite::Deleted {
            tables.extend(schema.related_tables(table));
        }
        self.invalidate(ctx, tables, db).await
    }

    /// Invalidate every table `schema` knows about.
    pub async fn flush<S>(
        &self,
        ctx: &mut CacheContext,
        schema: &S,
        db: &str,
    ) -> Result<(), CacheError>
    where
        S: RelationSchema + ?Sized,
    {
        let tables = schema.all_tables();
        info!(db, tables = tables.len(), "flushing query cache");
        self.invalidate(ctx, tables, db).await
    }

    async fn result_key(
        &self,
        ctx: &mut CacheContext,
        tables: &BTreeSet<String>,
        db: &str,
        query: &QueryFingerprint,
    ) -> Result<String, CacheError> {
        let generation = self.inner.generations.generation_for(ctx, tables, db).await?;
        Ok(self.inner.keygen.result_key(&generation, query, db))
    }

    fn emit(&self, event: CacheEvent) {
        self.inner.sink.emit(&event);
    }
}

async fn run<T, F, Fut>(execute: F) -> Result<QueryOutput<T>, CacheError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Fetched<T>, BoxError>>,
{
    let fetched = execute().await.map_err(CacheError::Executor)?;
    fetched.materialize().await.map_err(CacheError::Executor)
}
