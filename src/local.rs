//! Local (L1) store adapter
//!
//! The in-process store is partitioned into named regions, one per logical
//! cache use-case. Each region is an independent bounded Moka cache whose
//! entries carry their own TTL, so a backfilled entry can expire before the
//! remote copy it was taken from.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use moka::{Expiry, future::Cache};
use tracing::debug;

use crate::error::Result;

/// Longest lifetime a local entry is given; longer TTLs are capped
const MAX_LOCAL_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Contract for the bounded, per-entry-TTL in-process cache
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    async fn get(&self, region: &str, key: &str) -> Option<String>;

    /// Insert or replace an entry. A zero TTL stores nothing.
    async fn put(&self, region: &str, key: &str, value: String, ttl_seconds: u64);

    /// Evict an entry, returning whether one was present
    async fn remove(&self, region: &str, key: &str) -> bool;

    /// Return the cached value, or run `loader` and cache what it yields.
    ///
    /// The loader is only polled on a miss.
    async fn get_or_load(
        &self,
        region: &str,
        key: &str,
        loader: BoxFuture<'_, Result<Option<String>>>,
        ttl_seconds: u64,
    ) -> Result<Option<String>> {
        if let Some(value) = self.get(region, key).await {
            return Ok(Some(value));
        }
        let loaded = loader.await?;
        if let Some(value) = &loaded {
            self.put(region, key, value.clone(), ttl_seconds).await;
        }
        Ok(loaded)
    }
}

#[derive(Clone)]
struct LocalValue {
    json: Arc<str>,
    ttl: Duration,
}

/// Expires every entry after the TTL it was written with
struct PerEntryTtl;

impl Expiry<String, LocalValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// [`LocalStore`] backed by one Moka cache per region
#[derive(Clone)]
pub struct MokaLocalStore {
    regions: Arc<DashMap<String, Cache<String, LocalValue>>>,
    max_capacity: u64,
}

impl MokaLocalStore {
    /// Create a store whose regions each hold at most `max_capacity` entries
    pub fn new(max_capacity: u64) -> Self {
        Self {
            regions: Arc::new(DashMap::new()),
            max_capacity,
        }
    }

    fn region(&self, region: &str) -> Option<Cache<String, LocalValue>> {
        self.regions.get(region).map(|r| r.value().clone())
    }

    fn region_or_create(&self, region: &str) -> Cache<String, LocalValue> {
        if let Some(cache) = self.region(region) {
            return cache;
        }
        self.regions
            .entry(region.to_owned())
            .or_insert_with(|| {
                debug!("Creating local cache region '{}'", region);
                Cache::builder()
                    .max_capacity(self.max_capacity)
                    .expire_after(PerEntryTtl)
                    .build()
            })
            .value()
            .clone()
    }

    /// Approximate number of live entries in a region
    pub async fn region_size(&self, region: &str) -> u64 {
        match self.region(region) {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        }
    }

    /// Names of the regions created so far
    pub fn region_names(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.key().clone()).collect()
    }
}

#[async_trait]
impl LocalStore for MokaLocalStore {
    async fn get(&self, region: &str, key: &str) -> Option<String> {
        let cache = self.region(region)?;
        cache.get(key).await.map(|v| v.json.to_string())
    }

    async fn put(&self, region: &str, key: &str, value: String, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            return;
        }
        let cache = self.region_or_create(region);
        cache
            .insert(
                key.to_owned(),
                LocalValue {
                    json: Arc::from(value),
                    ttl: Duration::from_secs(ttl_seconds).min(MAX_LOCAL_TTL),
                },
            )
            .await;
    }

    async fn remove(&self, region: &str, key: &str) -> bool {
        match self.region(region) {
            Some(cache) => cache.remove(key).await.is_some(),
            None => false,
        }
    }
}
