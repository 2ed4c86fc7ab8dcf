//! Penetration protection
//!
//! [`PenetrationGuard`] wraps the coordinator and, on every read, checks in
//! order:
//!
//! 1. a per-(module, key) request budget ([`RateLimiter`])
//! 2. a probabilistic existence filter ([`ExistenceFilter`])
//! 3. the two cache layers
//! 4. a null marker recording that the key was recently looked up and did
//!    not exist
//!
//! Every check fails open: an error inside the limiter or the filter lets
//! the request through rather than hiding data.
//!
//! The existence filter has no removal. Deleting a key leaves its bit set,
//! because clearing it could also hide a different key hashing to the same
//! bit. When the filter is enabled, callers must mark keys as they are
//! created in the system of record; keys written before the filter was
//! enabled read as absent until they are marked.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    CacheError,
    config::{PenetrationProtectionConfig, RateLimitConfig},
    entry::ttl_to_i64,
    error::Result,
    key::CacheKeyGenerator,
    remote::RemoteStore,
    two_level_cache::{CacheStrategy, Cacheable, TwoLevelCache},
};

const NULL_MARKER_VALUE: &str = "null";

/// Requests seen for one (module, key) in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitCounter {
    pub window_start: DateTime<Utc>,
    pub count: u64,
}

/// Fixed budget of `requests_per_second * window_size_seconds` per window,
/// shared by all instances through the remote store.
///
/// The read-increment-write is not atomic; concurrent callers may both be
/// let through at the edge of the budget.
pub struct RateLimiter {
    remote: Arc<dyn RemoteStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(remote: Arc<dyn RemoteStore>, config: RateLimitConfig) -> Self {
        Self { remote, config }
    }

    /// Count a request and report whether it fits the budget
    pub async fn try_acquire(&self, module: &str, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.check(module, key).await {
            Ok(allowed) => {
                if !allowed {
                    debug!("Rate limit exceeded for {}:{}", module, key);
                }
                allowed
            }
            Err(e) => {
                warn!("Rate limiter error for {}:{}: {}. Allowing.", module, key, e);
                true
            }
        }
    }

    async fn check(&self, module: &str, key: &str) -> Result<bool> {
        let counter_key = CacheKeyGenerator::rate_limit_key(module, key);
        let now = Utc::now();
        let window = TimeDelta::try_seconds(ttl_to_i64(self.config.window_size_seconds))
            .unwrap_or(TimeDelta::MAX);

        let mut counter = match self.remote.get(&counter_key).await? {
            Some(raw) => serde_json::from_str::<RateLimitCounter>(&raw)?,
            None => RateLimitCounter {
                window_start: now,
                count: 0,
            },
        };

        if now - counter.window_start > window {
            counter = RateLimitCounter {
                window_start: now,
                count: 0,
            };
        }
        counter.count += 1;

        self.remote
            .set(
                &counter_key,
                &serde_json::to_string(&counter)?,
                Some(self.config.window_size_seconds.saturating_mul(2).max(1)),
            )
            .await?;

        Ok(counter.count <= self.config.budget())
    }
}

/// Single-hash bit array per module stored in the remote store
pub struct ExistenceFilter {
    remote: Arc<dyn RemoteStore>,
    size: u64,
}

impl ExistenceFilter {
    pub fn new(remote: Arc<dyn RemoteStore>, size: u64) -> Self {
        Self {
            remote,
            size: size.max(1),
        }
    }

    /// Bit position of `(module, key)`; identical on every instance
    pub fn offset(&self, module: &str, key: &str) -> u64 {
        let digest = Sha256::digest(CacheKeyGenerator::data_key(module, key).as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix) % self.size
    }

    /// `false` only if the key was never marked. Errors read as "may exist".
    pub async fn maybe_exists(&self, module: &str, key: &str) -> bool {
        let filter_key = CacheKeyGenerator::bloom_filter_key(module);
        match self
            .remote
            .get_bit(&filter_key, self.offset(module, key))
            .await
        {
            Ok(bit) => bit,
            Err(e) => {
                warn!(
                    "Existence filter read failed for {}:{}: {}. Assuming present.",
                    module, key, e
                );
                true
            }
        }
    }

    pub async fn mark_exists(&self, module: &str, key: &str) {
        let filter_key = CacheKeyGenerator::bloom_filter_key(module);
        if let Err(e) = self
            .remote
            .set_bit(&filter_key, self.offset(module, key), true)
            .await
        {
            warn!(
                "Existence filter write failed for {}:{}: {}",
                module, key, e
            );
        }
    }
}

/// Result of a protected read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Not cached anywhere; the caller may load it
    Miss,
    /// Recently confirmed absent
    NullCached,
    /// Over budget; try again later. Says nothing about whether data exists.
    RateLimited,
    /// The existence filter has never seen this key
    Filtered,
}

impl<T> Lookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

#[derive(Default)]
struct Counters {
    rate_limited: AtomicU64,
    filtered: AtomicU64,
    null_hits: AtomicU64,
    null_markers_written: AtomicU64,
}

/// Snapshot of guard counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtectionStats {
    pub rate_limited: u64,
    pub filtered: u64,
    pub null_hits: u64,
    pub null_markers_written: u64,
}

/// Coordinator wrapper adding rate limiting, existence filtering and
/// null-value caching
pub struct PenetrationGuard {
    cache: Arc<TwoLevelCache>,
    remote: Arc<dyn RemoteStore>,
    config: PenetrationProtectionConfig,
    rate_limiter: RateLimiter,
    filter: Option<ExistenceFilter>,
    counters: Counters,
}

impl PenetrationGuard {
    pub fn new(cache: Arc<TwoLevelCache>, config: PenetrationProtectionConfig) -> Self {
        let remote = Arc::clone(cache.remote());
        let rate_limiter = RateLimiter::new(Arc::clone(&remote), config.rate_limit.clone());
        let filter = (config.enabled && config.enable_bloom_filter)
            .then(|| ExistenceFilter::new(Arc::clone(&remote), config.bloom_filter_size));

        Self {
            cache,
            remote,
            config,
            rate_limiter,
            filter,
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<TwoLevelCache> {
        &self.cache
    }

    pub fn filter(&self) -> Option<&ExistenceFilter> {
        self.filter.as_ref()
    }

    pub fn stats(&self) -> ProtectionStats {
        let c = &self.counters;
        ProtectionStats {
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            null_hits: c.null_hits.load(Ordering::Relaxed),
            null_markers_written: c.null_markers_written.load(Ordering::Relaxed),
        }
    }

    /// Protected read with the reason for any absence
    pub async fn lookup<T: Cacheable>(
        &self,
        module: &str,
        key: &str,
        strategy: CacheStrategy,
    ) -> Lookup<T> {
        if !self.config.enabled {
            return match self.cache.get(module, key, strategy).await {
                Some(value) => Lookup::Hit(value),
                None => Lookup::Miss,
            };
        }

        if !self.rate_limiter.try_acquire(module, key).await {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Lookup::RateLimited;
        }

        if let Some(filter) = &self.filter
            && !filter.maybe_exists(module, key).await
        {
            debug!("Existence filter rejected {}:{}", module, key);
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return Lookup::Filtered;
        }

        if let Some(value) = self.cache.get(module, key, strategy).await {
            return Lookup::Hit(value);
        }

        if self.is_null_cached(module, key).await {
            debug!("Null marker hit for {}:{}", module, key);
            self.counters.null_hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::NullCached;
        }

        Lookup::Miss
    }

    /// Protected read; every kind of absence is `None`
    pub async fn get_with_protection<T: Cacheable>(
        &self,
        module: &str,
        key: &str,
        strategy: CacheStrategy,
    ) -> Option<T> {
        self.lookup(module, key, strategy).await.into_option()
    }

    /// Protected read-through.
    ///
    /// The loader only runs on a genuine miss. A value it returns is cached
    /// and marked as existing; `None` is recorded as a null marker so the
    /// next lookups stop at the cache.
    pub async fn get_or_load_with_protection<T, F, Fut, E>(
        &self,
        module: &str,
        key: &str,
        loader: F,
        expire_seconds: u64,
        strategy: CacheStrategy,
    ) -> Result<Option<T>>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.lookup(module, key, strategy).await {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::RateLimited | Lookup::Filtered | Lookup::NullCached => Ok(None),
            Lookup::Miss => {
                let loaded = loader().await.map_err(|e| CacheError::Backend(e.into()))?;
                match &loaded {
                    Some(value) => {
                        self.save(module, key, value, expire_seconds, strategy)
                            .await?
                    }
                    None if self.config.enabled => self.save_null_value(module, key).await,
                    None => {}
                }
                Ok(loaded)
            }
        }
    }

    /// Write through the coordinator, mark the key as existing and drop any
    /// null marker
    pub async fn save<T: Serialize + Sync>(
        &self,
        module: &str,
        key: &str,
        value: &T,
        expire_seconds: u64,
        strategy: CacheStrategy,
    ) -> Result<()> {
        self.cache
            .save(module, key, value, expire_seconds, strategy)
            .await?;

        if let Some(filter) = &self.filter {
            filter.mark_exists(module, key).await;
        }

        if self.config.enabled {
            let null_key = CacheKeyGenerator::null_marker_key(module, key);
            if let Err(e) = self.remote.delete(&null_key).await {
                warn!("Failed to clear null marker {}: {}", null_key, e);
            }
        }
        Ok(())
    }

    /// Delete through the coordinator. The existence filter keeps the key.
    pub async fn delete(&self, module: &str, key: &str, strategy: CacheStrategy) -> u64 {
        self.cache.delete(module, key, strategy).await
    }

    /// Record that `(module, key)` does not exist, for
    /// `nullValueExpireSeconds`
    pub async fn save_null_value(&self, module: &str, key: &str) {
        let null_key = CacheKeyGenerator::null_marker_key(module, key);
        match self
            .remote
            .set(
                &null_key,
                NULL_MARKER_VALUE,
                Some(self.config.null_value_expire_seconds),
            )
            .await
        {
            Ok(()) => {
                self.counters
                    .null_markers_written
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Failed to write null marker {}: {}", null_key, e),
        }
    }

    pub async fn is_null_cached(&self, module: &str, key: &str) -> bool {
        let null_key = CacheKeyGenerator::null_marker_key(module, key);
        match self.remote.exists(&null_key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Failed to read null marker {}: {}", null_key, e);
                false
            }
        }
    }

    /// Mark a key in the existence filter; a no-op when the filter is off
    pub async fn mark_exists(&self, module: &str, key: &str) {
        if let Some(filter) = &self.filter {
            filter.mark_exists(module, key).await;
        }
    }

    /// `true` when the filter is off
    pub async fn maybe_exists(&self, module: &str, key: &str) -> bool {
        match &self.filter {
            Some(filter) => filter.maybe_exists(module, key).await,
            None => true,
        }
    }
}
