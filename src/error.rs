//! Cache error types

use redis::RedisError;

/// Boxed error produced by host-supplied collaborators (executors, resolvers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Value for key {key} is {size} bytes, backend limit is {limit}")]
    Oversized {
        key: String,
        size: usize,
        limit: usize,
    },

    /// The real query failed. The inner error is the executor's own, untouched.
    #[error("Executor error: {0}")]
    Executor(BoxError),

    /// The tables touched by a write could not be determined.
    #[error("Table resolution error: {0}")]
    Resolve(BoxError),
}

impl CacheError {
    /// Returns true for failures that mean the shared cache could not be reached.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, CacheError::Redis(_))
    }

    /// Recover the executor's original error, if this is one.
    pub fn into_executor_error(self) -> Option<BoxError> {
        match self {
            CacheError::Executor(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("duplicate key in genre")]
    struct ConstraintViolation;

    #[test]
    fn executor_error_is_recoverable_by_downcast() {
        let err = CacheError::Executor(Box::new(ConstraintViolation));
        assert!(!err.is_backend_unavailable());

        let inner = err.into_executor_error().expect("executor error");
        assert!(inner.downcast_ref::<ConstraintViolation>().is_some());
    }

    #[test]
    fn oversized_message_names_key_and_limit() {
        let err = CacheError::Oversized {
            key: "jc_default_query_abc".to_owned(),
            size: 2048,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("jc_default_query_abc"));
        assert!(msg.contains("1024"));
    }
}
