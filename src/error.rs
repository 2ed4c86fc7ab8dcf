//! Cache error types

use redis::RedisError;

/// Cache-related errors
///
/// Most of these never reach callers of the coordinator or the guard: store
/// failures are logged and treated as misses. Only serialization of the
/// caller's own value and loader failures are surfaced.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used by store adapters and fallible cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
