//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache stack requires at least one layer")]
    NoLayers,

    #[error("operation attempted on a disposed cache stack")]
    Disposed,

    #[error("extension is already registered to a cache stack")]
    AlreadyRegistered,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Redis transaction was not committed")]
    TransactionRejected,

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),
}
