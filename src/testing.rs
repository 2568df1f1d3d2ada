//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{MemoryCache, SharedCache};
use crate::events::{CacheEvent, EventSink};
use crate::CacheError;

fn unavailable() -> CacheError {
    CacheError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

/// Memory cache whose reads and writes can be made to fail.
#[derive(Default)]
pub(crate) struct FlakyCache {
    inner: MemoryCache,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_attempts: AtomicUsize,
}

impl FlakyCache {
    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedCache for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.set(key, value, ttl).await
    }
}

/// Event sink that remembers everything it saw.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl RecordingSink {
    pub(crate) fn take(&self) -> Vec<CacheEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &CacheEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
