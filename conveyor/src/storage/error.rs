use crate::core::CoreError;
use thiserror::Error;

/// Storage layer error type for the conveyor task engine.
///
/// This error type wraps underlying store and serialization errors
/// while preserving the full error chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The store could not be reached or a connection could not be obtained.
    #[error("connection error: {0}")]
    Connection(String),

    /// A Redis command failed.
    #[cfg(feature = "redis")]
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, StorageError>;
