//! Explicit read/write interception
//!
//! The host wraps every query it issues in [`Interceptor::read`] or
//! [`Interceptor::write`]. The interceptor asks a [`TableResolver`] which
//! tables a query touches and hands execution to a [`QueryExecutor`], so the
//! cache never needs to know what a query looks like.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::SharedCache;
use crate::engine::{Cacheable, EntityWrite, Fetched, QueryCache, QueryOutput};
use crate::keys::QueryFingerprint;
use crate::overlay::CacheContext;
use crate::schema::RelationSchema;
use crate::{BoxError, CacheError};

/// Works out which tables a query reads or writes.
///
/// Must be a pure function of the query and must include tables reached
/// through subqueries.
pub trait TableResolver<Q>: Send + Sync {
    fn read_tables(&self, query: &Q) -> Result<BTreeSet<String>, BoxError>;

    fn write_tables(&self, query: &Q) -> Result<BTreeSet<String>, BoxError>;
}

/// Runs queries against the real data store.
#[async_trait]
pub trait QueryExecutor<Q>: Send + Sync {
    type Row: Cacheable;

    /// Database alias the query runs against
    fn database(&self, query: &Q) -> String;

    /// Cache identity of a read, or `None` when the query compiles to an
    /// empty statement that cannot be keyed.
    fn fingerprint(&self, query: &Q) -> Option<QueryFingerprint>;

    async fn fetch(&self, query: &Q) -> Result<Fetched<Self::Row>, BoxError>;

    /// Perform a write and return the number of affected rows.
    async fn execute_write(&self, query: &Q) -> Result<u64, BoxError>;
}

/// Query front door combining the cache engine with the host's resolver and
/// executor.
pub struct Interceptor<B: SharedCache, R, X> {
    cache: QueryCache<B>,
    resolver: R,
    executor: X,
    schema: Option<Arc<dyn RelationSchema>>,
}

impl<B, R, X> Interceptor<B, R, X>
where
    B: SharedCache,
{
    pub fn new(cache: QueryCache<B>, resolver: R, executor: X) -> Self {
        Self {
            cache,
            resolver,
            executor,
            schema: None,
        }
    }

    /// Use `schema` for [`Interceptor::entity_written`] cascades.
    pub fn with_schema(mut self, schema: Arc<dyn RelationSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn cache(&self) -> &QueryCache<B> {
        &self.cache
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// Run a read through the cache.
    ///
    /// If the tables cannot be resolved the read runs uncached.
    pub async fn read<Q>(
        &self,
        ctx: &mut CacheContext,
        query: &Q,
    ) -> Result<QueryOutput<X::Row>, CacheError>
    where
        Q: Sync,
        R: TableResolver<Q>,
        X: QueryExecutor<Q>,
    {
        let Some(fingerprint) = self.executor.fingerprint(query) else {
            debug!("empty statement, bypassing query cache");
            let fetched = self
                .executor
                .fetch(query)
                .await
                .map_err(CacheError::Executor)?;
            return fetched.materialize().await.map_err(CacheError::Executor);
        };

        let tables = self.resolver.read_tables(query).unwrap_or_else(|e| {
            warn!(
                query = %fingerprint.text,
                error = %e,
                "could not resolve read tables, skipping cache"
            );
            BTreeSet::new()
        });
        let db = self.executor.database(query);

        self.cache
            .lookup_or_compute(ctx, &tables, &db, &fingerprint, || {
                self.executor.fetch(query)
            })
            .await
    }

    /// Run a write, then invalidate every table it touched.
    ///
    /// Tables are resolved before the write runs; a write whose tables
    /// cannot be resolved is refused with [`CacheError::Resolve`]. If the
    /// write itself fails nothing is invalidated.
    pub async fn write<Q>(&self, ctx: &mut CacheContext, query: &Q) -> Result<u64, CacheError>
    where
        Q: Sync,
        R: TableResolver<Q>,
        X: QueryExecutor<Q>,
    {
        let tables = self
            .resolver
            .write_tables(query)
            .map_err(CacheError::Resolve)?;
        let db = self.executor.database(query);

        let affected = self
            .executor
            .execute_write(query)
            .await
            .map_err(CacheError::Executor)?;

        if self.executor.fingerprint(query).is_none() {
            debug!(db, "empty write statement, nothing to invalidate");
            return Ok(affected);
        }
        self.cache.invalidate(ctx, &tables, &db).await?;
        Ok(affected)
    }

    /// Entity-level write hook; deletes cascade through the configured schema.
    pub async fn entity_written(
        &self,
        ctx: &mut CacheContext,
        table: &str,
        write: EntityWrite,
        db: &str,
    ) -> Result<(), CacheError> {
        match &self.schema {
            Some(schema) => {
                self.cache
                    .on_entity_write(ctx, schema.as_ref(), table, write, db)
                    .await
            }
            None => self.cache.invalidate(ctx, [table], db).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::CacheConfig;
    use crate::backend::MemoryCache;
    use crate::keys::ResultShape;
    use crate::schema::StaticSchema;
    use crate::testing::RecordingSink;

    /// A toy query: `tables` read or written, `sql` empty for an empty statement.
    struct Sql {
        sql: &'static str,
        tables: &'static [&'static str],
        db: &'static str,
    }

    const fn select(sql: &'static str, tables: &'static [&'static str]) -> Sql {
        Sql {
            sql,
            tables,
            db: "default",
        }
    }

    struct Resolver;

    impl TableResolver<Sql> for Resolver {
        fn read_tables(&self, query: &Sql) -> Result<BTreeSet<String>, BoxError> {
            if query.tables.contains(&"?") {
                return Err("unresolvable subquery".into());
            }
            Ok(query.tables.iter().map(|t| (*t).to_owned()).collect())
        }

        fn write_tables(&self, query: &Sql) -> Result<BTreeSet<String>, BoxError> {
            self.read_tables(query)
        }
    }

    /// Table store keyed by table name; reads return the row count seen.
    #[derive(Default)]
    struct Store {
        rows: Mutex<Vec<&'static str>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl QueryExecutor<Sql> for Store {
        type Row = String;

        fn database(&self, query: &Sql) -> String {
            query.db.to_owned()
        }

        fn fingerprint(&self, query: &Sql) -> Option<QueryFingerprint> {
            (!query.sql.is_empty()).then(|| QueryFingerprint::new(query.sql, ResultShape::Multi))
        }

        async fn fetch(&self, query: &Sql) -> Result<Fetched<String>, BoxError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if query.sql.is_empty() {
                return Ok(Fetched::Rows(Vec::new()));
            }
            let rows = self.rows.lock().unwrap();
            Ok(Fetched::Rows(
                rows.iter()
                    .filter(|row| query.tables.iter().any(|t| row.starts_with(t)))
                    .map(|row| (*row).to_owned())
                    .collect(),
            ))
        }

        async fn execute_write(&self, query: &Sql) -> Result<u64, BoxError> {
            if query.sql == "FAIL" {
                return Err("deadlock detected".into());
            }
            if query.sql.is_empty() {
                return Ok(0);
            }
            self.rows.lock().unwrap().push(query.sql);
            Ok(1)
        }
    }

    fn interceptor() -> (Interceptor<MemoryCache, Resolver, Store>, RecordingSink) {
        let sink = RecordingSink::default();
        let cache = QueryCache::with_sink(
            MemoryCache::default(),
            CacheConfig::default(),
            Arc::new(sink.clone()),
        );
        (Interceptor::new(cache, Resolver, Store::default()), sink)
    }

    fn outcomes(sink: &RecordingSink) -> Vec<&'static str> {
        sink.take().iter().map(|e| e.outcome()).collect()
    }

    #[tokio::test]
    async fn write_invalidates_cached_reads() {
        let (db, sink) = interceptor();
        let mut ctx = CacheContext::new();
        let read = select("SELECT * FROM genre", &["genre"]);

        assert!(db.read(&mut ctx, &read).await.unwrap().is_empty());
        assert!(db.read(&mut ctx, &read).await.unwrap().is_empty());

        let affected = db
            .write(&mut ctx, &select("genre: horror", &["genre"]))
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = db.read(&mut ctx, &read).await.unwrap().into_rows();
        assert_eq!(rows, vec!["genre: horror".to_owned()]);
        assert_eq!(outcomes(&sink), ["miss", "hit", "miss"]);
    }

    #[tokio::test]
    async fn unresolvable_read_runs_uncached() {
        let (db, sink) = interceptor();
        let mut ctx = CacheContext::new();
        let read = select("SELECT * FROM genre WHERE id IN (...)", &["genre", "?"]);

        db.read(&mut ctx, &read).await.unwrap();
        db.read(&mut ctx, &read).await.unwrap();
        assert_eq!(db.executor().fetches.load(Ordering::SeqCst), 2);
        assert_eq!(outcomes(&sink), ["skipped", "skipped"]);
    }

    #[tokio::test]
    async fn unresolvable_write_is_refused() {
        let (db, _) = interceptor();
        let mut ctx = CacheContext::new();

        let err = db
            .write(&mut ctx, &select("genre: ?", &["?"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Resolve(_)));
        assert!(db.executor().rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_cache() {
        let (db, sink) = interceptor();
        let mut ctx = CacheContext::new();
        let read = select("SELECT * FROM genre", &["genre"]);

        db.read(&mut ctx, &read).await.unwrap();
        let err = db
            .write(&mut ctx, &select("FAIL", &["genre"]))
            .await
            .unwrap_err();
        assert_eq!(
            err.into_executor_error().unwrap().to_string(),
            "deadlock detected"
        );
        db.read(&mut ctx, &read).await.unwrap();
        assert_eq!(outcomes(&sink), ["miss", "hit"]);
    }

    #[tokio::test]
    async fn empty_statement_bypasses_cache() {
        let (db, sink) = interceptor();
        let mut ctx = CacheContext::new();
        let empty = select("", &["genre"]);

        assert!(db.read(&mut ctx, &empty).await.unwrap().is_empty());
        assert_eq!(db.write(&mut ctx, &empty).await.unwrap(), 0);
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn entity_delete_cascades_with_schema() {
        let (db, sink) = interceptor();
        let db = db.with_schema(Arc::new(StaticSchema::new().foreign_key("book", "genre")));
        let mut ctx = CacheContext::new();
        let books = select("SELECT * FROM book", &["book"]);

        db.read(&mut ctx, &books).await.unwrap();
        db.entity_written(&mut ctx, "genre", EntityWrite::Saved, "default")
            .await
            .unwrap();
        db.read(&mut ctx, &books).await.unwrap();
        db.entity_written(&mut ctx, "genre", EntityWrite::Deleted, "default")
            .await
            .unwrap();
        db.read(&mut ctx, &books).await.unwrap();

        assert_eq!(outcomes(&sink), ["miss", "hit", "miss"]);
    }
}
