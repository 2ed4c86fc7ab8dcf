//! tiercache - Two-level caching library
//!
//! This library provides a two-tier cache for services running as several
//! instances:
//! - L1: In-process Moka cache, partitioned into regions (fastest)
//! - L2: Redis cache (shared across instances)
//!
//! The cache supports:
//! - Four read/write strategies per call (`LocalOnly`, `RemoteOnly`,
//!   `LocalAndRemote`, `RemoteSyncToLocal`)
//! - Invalidation broadcast over Redis pub/sub, with a tracker that keeps
//!   slow readers from backfilling stale values
//! - Penetration protection: per-key rate limiting, an existence filter and
//!   null-value markers
//! - Background warmup of the local store at startup
//!
//! ```no_run
//! use tiercache::{CacheConfig, CacheStrategy, TieredCache};
//!
//! # async fn demo() -> tiercache::Result<()> {
//! let tiered = TieredCache::connect_redis("redis://127.0.0.1/", CacheConfig::default()).await?;
//! tiered
//!     .guard()
//!     .save("user", "42", &"alice", 3600, CacheStrategy::LocalAndRemote)
//!     .await?;
//! let name: Option<String> = tiered
//!     .guard()
//!     .get_with_protection("user", "42", CacheStrategy::LocalAndRemote)
//!     .await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod entry;
mod error;
pub mod invalidation;
mod key;
pub mod local;
pub mod protection;
pub mod remote;
#[cfg(test)]
mod testing;
mod two_level_cache;
pub mod warmup;

pub use builder::{TieredCache, TieredCacheBuilder};
pub use config::{
    CacheConfig, InvalidationConfig, LocalConfig, PenetrationProtectionConfig, RateLimitConfig,
    WarmupConfig,
};
pub use entry::{CacheEntry, derive_local_ttl};
pub use error::{CacheError, Result};
pub use invalidation::{
    EntryState, InvalidationBus, InvalidationListener, InvalidationMessage, InvalidationTracker,
    LocalInvalidationBus, RedisInvalidationBus,
};
pub use key::CacheKeyGenerator;
pub use local::{LocalStore, MokaLocalStore};
pub use protection::{Lookup, PenetrationGuard, ProtectionStats};
pub use remote::{RedisRemoteStore, RemoteStore};
pub use two_level_cache::{CacheStats, CacheStrategy, Cacheable, TwoLevelCache};
pub use warmup::{WarmupHandle, WarmupLoader, WarmupReport};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
