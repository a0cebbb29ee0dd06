//! Error types for cache operations.

use std::io;

use thiserror::Error;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache bookkeeping.
///
/// These never reach users of the high-level call API: the façade
/// recovers from every bookkeeping failure by recomputing, so this type
/// only surfaces on the low-level operations that return `CacheResult`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
