//! Transaction-aware buffering in front of the shared cache
//!
//! While a transaction is open on a database alias, cache writes for that
//! alias land in a local stack of buffers instead of the shared cache:
//!
//! - frame 0 belongs to the transaction itself
//! - each savepoint pushes a frame that collects the writes made after it
//!
//! Reads search the stack innermost-first before falling through to the
//! shared cache. Rolling back a savepoint drops its frame and everything above;
//! releasing it folds those frames into the parent. Only the outermost commit
//! reaches the shared cache.
//!
//! The stacks live in a [`CacheContext`] owned by the unit of work (request,
//! task) and passed explicitly to every call, so uncommitted writes are never
//! visible outside it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backend::{SharedCache, effective_ttl};
use crate::config::OversizePolicy;
use crate::{CacheConfig, CacheError};

#[derive(Debug, Default)]
struct Frame {
    /// `None` for the transaction's own frame
    savepoint: Option<String>,
    entries: HashMap<String, String>,
}

impl Frame {
    fn savepoint(id: &str) -> Self {
        Self {
            savepoint: Some(id.to_owned()),
            entries: HashMap::new(),
        }
    }
}

/// Buffer stack of one alias. Empty means no transaction.
#[derive(Debug, Default)]
struct TxState {
    frames: Vec<Frame>,
}

impl TxState {
    fn begun() -> Self {
        Self {
            frames: vec![Frame::default()],
        }
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.frames.iter().rev().find_map(|f| f.entries.get(key))
    }

    fn set(&mut self, key: &str, value: String) {
        if let Some(top) = self.frames.last_mut() {
            top.entries.insert(key.to_owned(), value);
        }
    }

    /// Index of the most recent frame opened by savepoint `id`.
    fn position(&self, id: &str) -> Option<usize> {
        self.frames
            .iter()
            .rposition(|f| f.savepoint.as_deref() == Some(id))
    }

    fn rollback_to(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.frames.truncate(idx);
                true
            }
            None => false,
        }
    }

    fn release(&mut self, id: &str) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        // savepoint frames always sit above the transaction frame, so idx >= 1
        let popped = self.frames.split_off(idx);
        let parent = &mut self.frames[idx - 1];
        for frame in popped {
            parent.entries.extend(frame.entries);
        }
        true
    }

    /// All buffered writes, later frames overriding earlier ones.
    fn into_merged(self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for frame in self.frames {
            merged.extend(frame.entries);
        }
        merged
    }

    fn buffered(&self) -> usize {
        self.frames.iter().map(|f| f.entries.len()).sum()
    }
}

/// Scratch space of one unit of work: the open transactions per database alias.
///
/// Must not be shared between units of work. Call [`CacheContext::clear`] at
/// the end of every unit of work that did not end in an explicit commit or
/// rollback.
#[derive(Debug, Default)]
pub struct CacheContext {
    transactions: HashMap<String, TxState>,
}

impl CacheContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a transaction is open on `db`.
    pub fn in_transaction(&self, db: &str) -> bool {
        self.transactions.contains_key(db)
    }

    /// Number of open savepoints on `db`.
    pub fn savepoint_depth(&self, db: &str) -> usize {
        self.transactions
            .get(db)
            .map_or(0, |tx| tx.frames.len().saturating_sub(1))
    }

    /// Number of writes buffered on `db` and not yet committed.
    pub fn buffered(&self, db: &str) -> usize {
        self.transactions.get(db).map_or(0, TxState::buffered)
    }

    /// Drop every open transaction and its buffered writes.
    pub fn clear(&mut self) {
        let dropped: usize = self.transactions.values().map(TxState::buffered).sum();
        if dropped > 0 {
            debug!(
                dropped,
                aliases = self.transactions.len(),
                "clearing unfinished cache transactions"
            );
        }
        self.transactions.clear();
    }
}

/// Read-through / write-behind layer over a [`SharedCache`].
pub struct TransactionalOverlay<B: SharedCache> {
    backend: Arc<B>,
    ttl: Duration,
    oversize_policy: OversizePolicy,
}

impl<B: SharedCache> TransactionalOverlay<B> {
    pub fn new(backend: Arc<B>, config: &CacheConfig) -> Self {
        let ttl = effective_ttl(config.ttl(), backend.as_ref());
        Self {
            backend,
            ttl,
            oversize_policy: config.oversize_policy,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// TTL applied to every write reaching the shared cache.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read `key`, preferring writes buffered in `ctx` for `db`.
    pub async fn get(
        &self,
        ctx: &CacheContext,
        db: &str,
        key: &str,
    ) -> Result<Option<String>, CacheError> {
        if let Some(value) = ctx.transactions.get(db).and_then(|tx| tx.get(key)) {
            debug!(key, db, "overlay hit in transaction buffer");
            return Ok(Some(value.clone()));
        }
        self.backend.get(key).await
    }

    /// Write `key`: into the innermost buffer if a transaction is open on
    /// `db`, otherwise straight to the shared cache.
    pub async fn set(
        &self,
        ctx: &mut CacheContext,
        db: &str,
        key: &str,
        value: String,
    ) -> Result<(), CacheError> {
        if let Some(tx) = ctx.transactions.get_mut(db) {
            tx.set(key, value);
            return Ok(());
        }
        self.write_through(key, value).await
    }

    /// Open a transaction on `db`. No-op if one is already open.
    pub fn begin(&self, ctx: &mut CacheContext, db: &str) {
        if ctx.in_transaction(db) {
            debug!(db, "transaction already open");
            return;
        }
        ctx.transactions.insert(db.to_owned(), TxState::begun());
    }

    /// Open savepoint `id`. Opens the transaction first if needed.
    pub fn savepoint(&self, ctx: &mut CacheContext, db: &str, id: &str) {
        let tx = ctx
            .transactions
            .entry(db.to_owned())
            .or_insert_with(TxState::begun);
        tx.frames.push(Frame::savepoint(id));
    }

    /// Discard every write made since savepoint `id` was opened.
    ///
    /// An unknown `id` leaves the stack untouched.
    pub fn rollback_savepoint(&self, ctx: &mut CacheContext, db: &str, id: &str) {
        let found = ctx
            .transactions
            .get_mut(db)
            .is_some_and(|tx| tx.rollback_to(id));
        if !found {
            warn!(db, savepoint = id, "rollback of unknown savepoint ignored");
        }
    }

    /// Fold the writes made since savepoint `id` into the enclosing scope.
    ///
    /// An unknown `id` leaves the stack untouched.
    pub fn commit_savepoint(&self, ctx: &mut CacheContext, db: &str, id: &str) {
        let found = ctx
            .transactions
            .get_mut(db)
            .is_some_and(|tx| tx.release(id));
        if !found {
            warn!(db, savepoint = id, "commit of unknown savepoint ignored");
        }
    }

    /// Publish every write buffered on `db` to the shared cache and close the
    /// transaction.
    ///
    /// Every key is attempted even if some fail; local state is cleared either
    /// way and the first failure is returned.
    pub async fn commit(&self, ctx: &mut CacheContext, db: &str) -> Result<(), CacheError> {
        let Some(tx) = ctx.transactions.remove(db) else {
            debug!(db, "commit without open transaction");
            return Ok(());
        };
        let entries = tx.into_merged();
        debug!(db, entries = entries.len(), "flushing transaction buffer");

        let mut first_error = None;
        for (key, value) in entries {
            if let Err(e) = self.write_through(&key, value).await {
                error!(
                    key = %key,
                    db,
                    error = %e,
                    "failed to publish committed cache write; stale results may be served"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every write buffered on `db` and close the transaction.
    pub fn rollback(&self, ctx: &mut CacheContext, db: &str) {
        if let Some(tx) = ctx.transactions.remove(db) {
            debug!(db, discarded = tx.buffered(), "transaction buffer discarded");
        }
    }

    async fn write_through(&self, key: &str, value: String) -> Result<(), CacheError> {
        match self.backend.set(key, value, self.ttl).await {
            Err(CacheError::Oversized { key, size, limit })
                if self.oversize_policy == OversizePolicy::Ignore =>
            {
                warn!(key = %key, size, limit, "value too large for cache, not stored");
                Ok(())
            }
            other => other,
        }
    }
}
