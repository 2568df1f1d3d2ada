//! Table generations
//!
//! Each table has a random generation token stored under its table key. A
//! query over several tables uses a token stored under the hash of the sorted
//! single-table tokens. Replacing one table's token therefore orphans every
//! combined token and every result key built from either, without
//! enumerating them.
//!
//! All reads and writes go through the overlay, so a bump made inside a
//! transaction only becomes visible to others on commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::backend::SharedCache;
use crate::keys::KeyGenerator;
use crate::overlay::{CacheContext, TransactionalOverlay};
use crate::CacheError;

pub struct GenerationStore<B: SharedCache> {
    overlay: Arc<TransactionalOverlay<B>>,
    keygen: KeyGenerator,
}

impl<B: SharedCache> GenerationStore<B> {
    pub fn new(overlay: Arc<TransactionalOverlay<B>>, keygen: KeyGenerator) -> Self {
        Self { overlay, keygen }
    }

    /// Current generation for a set of tables, creating missing tokens.
    ///
    /// Concurrent creators may race; the last write wins, which is harmless
    /// since nothing can have been cached under a token that did not exist.
    pub async fn generation_for(
        &self,
        ctx: &mut CacheContext,
        tables: &BTreeSet<String>,
        db: &str,
    ) -> Result<String, CacheError> {
        if let (1, Some(table)) = (tables.len(), tables.first()) {
            return self.table_generation(ctx, table, db).await;
        }

        let mut tokens = Vec::with_capacity(tables.len());
        for table in tables {
            tokens.push(self.table_generation(ctx, table, db).await?);
        }
        tokens.sort_unstable();
        tokens.dedup();

        let key = self.keygen.multi_key(&tokens, db);
        self.fetch_or_create(ctx, &key, db).await
    }

    /// Replace a table's generation and return the new token.
    pub async fn invalidate(
        &self,
        ctx: &mut CacheContext,
        table: &str,
        db: &str,
    ) -> Result<String, CacheError> {
        let key = self.keygen.table_key(table, db);
        let token = self.keygen.fresh_token();
        self.overlay.set(ctx, db, &key, token.clone()).await?;
        debug!(table, db, generation = %token, "table generation replaced");
        Ok(token)
    }

    async fn table_generation(
        &self,
        ctx: &mut CacheContext,
        table: &str,
        db: &str,
    ) -> Result<String, CacheError> {
        let key = self.keygen.table_key(table, db);
        self.fetch_or_create(ctx, &key, db).await
    }

    async fn fetch_or_create(
        &self,
        ctx: &mut CacheContext,
        key: &str,
        db: &str,
    ) -> Result<String, CacheError> {
        if let Some(token) = self.overlay.get(ctx, db, key).await? {
            return Ok(token);
        }
        let token = self.keygen.fresh_token();
        self.overlay.set(ctx, db, key, token.clone()).await?;
        debug!(key, db, generation = %token, "generation created");
        Ok(token)
    }
}
