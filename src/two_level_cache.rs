//! Two-level cache coordinator
//!
//! Combines the in-process store (L1) and the shared remote store (L2)
//! according to a per-call [`CacheStrategy`]:
//!
//! - `LocalOnly` / `RemoteOnly`: touch a single store
//! - `LocalAndRemote`: write both; read L1 first, fall back to L2 and backfill
//! - `RemoteSyncToLocal`: write L2 then L1 with a shortened TTL; read like
//!   `LocalAndRemote`
//!
//! Every backfill derives the local TTL from the *remaining* remote TTL, so
//! a local copy never outlives the remote one. Store failures are logged and
//! treated as misses; callers only see errors for values they cannot
//! serialize and for failing loaders.
//!
//! Concurrent `get_or_load` calls for the same cold key are not coalesced:
//! each caller runs its loader and the last write wins.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    CacheConfig, CacheError,
    entry::{CacheEntry, derive_local_ttl, ttl_to_i64},
    error::Result,
    invalidation::{InvalidationBus, InvalidationListener, InvalidationMessage, InvalidationTracker},
    key::CacheKeyGenerator,
    local::LocalStore,
    remote::{RemoteStore, TTL_NEVER},
};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Which stores an operation reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStrategy {
    LocalOnly,
    RemoteOnly,
    LocalAndRemote,
    RemoteSyncToLocal,
}

impl CacheStrategy {
    pub fn uses_local(self) -> bool {
        !matches!(self, CacheStrategy::RemoteOnly)
    }

    pub fn uses_remote(self) -> bool {
        !matches!(self, CacheStrategy::LocalOnly)
    }
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    backfills: AtomicU64,
    skipped_backfills: AtomicU64,
    store_errors: AtomicU64,
}

/// Snapshot of coordinator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub backfills: u64,
    /// Backfills dropped because an invalidation arrived after the read
    pub skipped_backfills: u64,
    pub store_errors: u64,
}

impl CacheStats {
    /// Fraction of reads served from either layer
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.remote_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Coordinator over an optional local store and a shared remote store
pub struct TwoLevelCache {
    remote: Arc<dyn RemoteStore>,
    local: Option<Arc<dyn LocalStore>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    tracker: InvalidationTracker,
    listener: Arc<InvalidationListener>,
    instance_id: String,
    local_default_ttl: u64,
    counters: Counters,
}

impl TwoLevelCache {
    /// Wire a coordinator. When a bus is given and invalidation is enabled,
    /// this instance's listener is subscribed to it immediately.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Option<Arc<dyn LocalStore>>,
        bus: Option<Arc<dyn InvalidationBus>>,
        tracker: InvalidationTracker,
        config: &CacheConfig,
    ) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let bus = bus.filter(|_| config.invalidation.enabled);
        let listener = Arc::new(InvalidationListener::new(
            instance_id.clone(),
            tracker.clone(),
            local.clone(),
        ));

        if let Some(bus) = &bus {
            bus.subscribe(Arc::clone(&listener).into_handler());
        }

        Self {
            remote,
            local,
            bus,
            tracker,
            listener,
            instance_id,
            local_default_ttl: config.local.default_ttl_seconds,
            counters: Counters::default(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn tracker(&self) -> &InvalidationTracker {
        &self.tracker
    }

    pub fn listener(&self) -> Arc<InvalidationListener> {
        Arc::clone(&self.listener)
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn local(&self) -> Option<&Arc<dyn LocalStore>> {
        self.local.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            local_hits: c.local_hits.load(Ordering::Relaxed),
            remote_hits: c.remote_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            backfills: c.backfills.load(Ordering::Relaxed),
            skipped_backfills: c.skipped_backfills.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Get a value; a miss and a store failure look the same
    pub async fn get<T: Cacheable>(
        &self,
        module: &str,
        key: &str,
        strategy: CacheStrategy,
    ) -> Option<T> {
        self.get_entry(module, key, strategy)
            .await
            .map(|entry| entry.data)
    }

    /// Get the whole entry, including its creation time and lifetime
    pub async fn get_entry<T: Cacheable>(
        &self,
        module: &str,
        key: &str,
        strategy: CacheStrategy,
    ) -> Option<CacheEntry<T>> {
        let found = match strategy {
            CacheStrategy::LocalOnly => self.read_local(module, key).await,
            CacheStrategy::RemoteOnly => self.read_remote(module, key).await.map(|(e, _)| e),
            CacheStrategy::LocalAndRemote | CacheStrategy::RemoteSyncToLocal => {
                if let Some(entry) = self.read_local(module, key).await {
                    return Some(entry);
                }
                let read_at = Utc::now();
                match self.read_remote::<T>(module, key).await {
                    Some((entry, raw)) => {
                        self.backfill(module, key, raw, read_at).await;
                        Some(entry)
                    }
                    None => None,
                }
            }
        };

        if found.is_none() {
            debug!("Cache miss for {}:{} ({:?})", module, key, strategy);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Get a value, running `loader` on a full miss and caching what it
    /// returns under the same strategy.
    ///
    /// The loader runs at most once per call. `None` from the loader is
    /// returned as-is and nothing is cached.
    pub async fn get_or_load<T, F, Fut, E>(
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
        if strategy == CacheStrategy::LocalOnly
            && let Some(local) = &self.local
        {
            return self
                .get_or_load_local(local, module, key, loader, expire_seconds)
                .await;
        }

        if let Some(value) = self.get(module, key, strategy).await {
            return Ok(Some(value));
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let loaded = loader().await.map_err(|e| CacheError::Backend(e.into()))?;
        if let Some(value) = &loaded {
            self.save(module, key, value, expire_seconds, strategy)
                .await?;
        }
        Ok(loaded)
    }

    async fn get_or_load_local<T, F, Fut, E>(
        &self,
        local: &Arc<dyn LocalStore>,
        module: &str,
        key: &str,
        loader: F,
        expire_seconds: u64,
    ) -> Result<Option<T>>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<T>, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let data_key = CacheKeyGenerator::data_key(module, key);
        let load = async {
            self.counters.loads.fetch_add(1, Ordering::Relaxed);
            let loaded = loader().await.map_err(|e| CacheError::Backend(e.into()))?;
            match loaded {
                Some(data) => {
                    let entry = CacheEntry::new(data_key, data, ttl_to_i64(expire_seconds));
                    Ok(Some(serde_json::to_string(&entry)?))
                }
                None => Ok(None),
            }
        }
        .boxed();

        let raw = local
            .get_or_load(module, key, load, self.local_ttl_for_write(expire_seconds))
            .await?;
        Ok(raw.and_then(|raw| decode::<T>(&raw).map(|entry| entry.data)))
    }

    /// Write a value under the given strategy.
    ///
    /// Dual writes are independent: if one store fails the other keeps the
    /// new value. Only a serialization failure is returned.
    pub async fn save<T: Serialize + Sync>(
        &self,
        module: &str,
        key: &str,
        value: &T,
        expire_seconds: u64,
        strategy: CacheStrategy,
    ) -> Result<()> {
        let data_key = CacheKeyGenerator::data_key(module, key);
        let entry = CacheEntry::new(data_key.as_str(), value, ttl_to_i64(expire_seconds));
        let json = serde_json::to_string(&entry)?;

        match strategy {
            CacheStrategy::LocalOnly => {
                self.write_local(module, key, json, self.local_ttl_for_write(expire_seconds))
                    .await;
            }
            CacheStrategy::RemoteOnly => {
                self.write_remote(&data_key, &json, expire_seconds).await;
                self.publish(module, key).await;
            }
            CacheStrategy::LocalAndRemote => {
                self.write_local(
                    module,
                    key,
                    json.clone(),
                    self.local_ttl_for_write(expire_seconds),
                )
                .await;
                self.write_remote(&data_key, &json, expire_seconds).await;
                self.publish(module, key).await;
            }
            CacheStrategy::RemoteSyncToLocal => {
                self.write_remote(&data_key, &json, expire_seconds).await;
                self.publish(module, key).await;
                let local_ttl = if expire_seconds == 0 {
                    self.local_default_ttl
                } else {
                    derive_local_ttl(ttl_to_i64(expire_seconds)) as u64
                };
                self.write_local(module, key, json, local_ttl).await;
            }
        }
        self.mark_written(module, key).await;
        Ok(())
    }

    /// Delete from every store the strategy touches.
    ///
    /// Returns how many copies were removed; deleting a missing key is 0.
    pub async fn delete(&self, module: &str, key: &str, strategy: CacheStrategy) -> u64 {
        let mut removed = 0;

        if strategy.uses_local()
            && let Some(local) = &self.local
            && local.remove(module, key).await
        {
            removed += 1;
        }

        if strategy.uses_remote() {
            let data_key = CacheKeyGenerator::data_key(module, key);
            match self.remote.delete(&data_key).await {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!("L2 DEL error for key {}: {}. Continuing.", data_key, e);
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.publish(module, key).await;
        }
        self.mark_written(module, key).await;

        debug!(
            "Deleted {}:{} ({:?}), {} copies removed",
            module, key, strategy, removed
        );
        removed
    }

    /// Change the remote lifetime of an entry.
    ///
    /// Local copies are evicted everywhere so the next read backfills them
    /// with a TTL derived from the new remote one. Returns `false` when the
    /// remote entry does not exist or the store is unreachable.
    pub async fn expire(&self, module: &str, key: &str, expire_seconds: u64) -> bool {
        let data_key = CacheKeyGenerator::data_key(module, key);
        let updated = match self.remote.expire(&data_key, expire_seconds).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!("L2 EXPIRE error for key {}: {}", data_key, e);
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        if let Some(local) = &self.local {
            local.remove(module, key).await;
        }
        if updated {
            self.publish(module, key).await;
        }
        updated
    }

    /// Remove every remote entry of a module and broadcast each removal
    pub async fn clear_module(&self, module: &str) -> u64 {
        let keys: Vec<String> = match self
            .remote
            .scan(&CacheKeyGenerator::scan_pattern(module))
            .await
        {
            Ok(keys) => keys.into_iter().collect(),
            Err(e) => {
                warn!("L2 SCAN error while clearing module {}: {}", module, e);
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };

        let removed = match self.remote.delete_many(&keys).await {
            Ok(count) => count,
            Err(e) => {
                warn!("L2 DEL error while clearing module {}: {}", module, e);
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        };

        for remote_key in &keys {
            if let Some(key) = CacheKeyGenerator::strip_module(module, remote_key) {
                if let Some(local) = &self.local {
                    local.remove(module, key).await;
                }
                self.mark_written(module, key).await;
                self.publish(module, key).await;
            }
        }
        removed
    }

    async fn read_local<T: Cacheable>(&self, module: &str, key: &str) -> Option<CacheEntry<T>> {
        let local = self.local.as_ref()?;
        let raw = local.get(module, key).await?;
        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) if entry.is_expired() => {
                local.remove(module, key).await;
                None
            }
            Ok(entry) => {
                debug!("Cache hit L1 for {}:{}", module, key);
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize L1 value for {}:{}: {}. Evicting corrupt entry.",
                    module, key, e
                );
                local.remove(module, key).await;
                None
            }
        }
    }

    /// Returns the decoded entry and the raw JSON for backfilling
    async fn read_remote<T: Cacheable>(
        &self,
        module: &str,
        key: &str,
    ) -> Option<(CacheEntry<T>, String)> {
        let data_key = CacheKeyGenerator::data_key(module, key);
        let raw = match self.remote.get(&data_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("L2 GET error for key {} ({}). Treating as miss.", data_key, e);
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) => {
                debug!("Cache hit L2 for {}", data_key);
                self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                Some((entry, raw))
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    data_key, e
                );
                if let Err(del_err) = self.remote.delete(&data_key).await {
                    warn!("Failed to delete corrupt L2 entry {}: {}", data_key, del_err);
                }
                None
            }
        }
    }

    /// Copy a value read from L2 at `read_at` into L1, unless an
    /// invalidation for it has been seen since.
    async fn backfill(&self, module: &str, key: &str, raw: String, read_at: DateTime<Utc>) {
        let Some(local) = &self.local else {
            return;
        };

        let data_key = CacheKeyGenerator::data_key(module, key);
        let remote_ttl = match self.remote.ttl(&data_key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!("L2 TTL error for key {}: {}. Skipping backfill.", data_key, e);
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let local_ttl = match remote_ttl {
            TTL_NEVER => self.local_default_ttl,
            ttl if ttl > 0 => derive_local_ttl(ttl) as u64,
            _ => {
                debug!("L2 entry {} vanished before backfill", data_key);
                return;
            }
        };

        if self.tracker.is_stale(module, key, read_at).await {
            debug!(
                "Skipping backfill of {}:{}: invalidated after read",
                module, key
            );
            self.counters
                .skipped_backfills
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        local.put(module, key, raw, local_ttl).await;

        // An invalidation may have landed while writing
        if self.tracker.is_stale(module, key, read_at).await {
            local.remove(module, key).await;
            self.counters
                .skipped_backfills
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.tracker.clear_if_older(module, key, read_at).await;
        self.counters.backfills.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Backfilled {}:{} into L1 with ttl {}s (remote ttl {}s)",
            module, key, local_ttl, remote_ttl
        );
    }

    async fn write_local(&self, module: &str, key: &str, json: String, ttl_seconds: u64) {
        let Some(local) = &self.local else {
            debug!("No local store configured; skipping L1 write for {}:{}", module, key);
            return;
        };
        local.put(module, key, json, ttl_seconds).await;
    }

    /// Record this instance's own change so an in-flight read that started
    /// before it cannot backfill the previous value. The listener drops our
    /// own broadcasts, so nothing else records it.
    async fn mark_written(&self, module: &str, key: &str) {
        if self.local.is_some() {
            self.tracker.record(module, key, Utc::now()).await;
        }
    }

    async fn write_remote(&self, data_key: &str, json: &str, expire_seconds: u64) {
        let ttl = (expire_seconds > 0).then_some(expire_seconds);
        if let Err(e) = self.remote.set(data_key, json, ttl).await {
            warn!("L2 SET error for key {}: {}. Continuing.", data_key, e);
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn publish(&self, module: &str, key: &str) {
        if let Some(bus) = &self.bus {
            bus.publish(&InvalidationMessage::new(module, key, &self.instance_id))
                .await;
        }
    }

    fn local_ttl_for_write(&self, expire_seconds: u64) -> u64 {
        if expire_seconds == 0 {
            self.local_default_ttl
        } else {
            expire_seconds
        }
    }
}

fn decode<T: Cacheable>(raw: &str) -> Option<CacheEntry<T>> {
    match serde_json::from_str::<CacheEntry<T>>(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Failed to deserialize cached entry: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        invalidation::LocalInvalidationBus,
        local::MokaLocalStore,
        testing::{MemoryRemoteStore, eventually},
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const ALL_STRATEGIES: [CacheStrategy; 4] = [
        CacheStrategy::LocalOnly,
        CacheStrategy::RemoteOnly,
        CacheStrategy::LocalAndRemote,
        CacheStrategy::RemoteSyncToLocal,
    ];

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    fn alice() -> User {
        User {
            id: 1,
            name: "alice".to_owned(),
        }
    }

    struct Instance {
        cache: TwoLevelCache,
        local: Arc<MokaLocalStore>,
    }

    fn instance(
        remote: &Arc<MemoryRemoteStore>,
        bus: Option<Arc<LocalInvalidationBus>>,
    ) -> Instance {
        let local = Arc::new(MokaLocalStore::new(1000));
        let config = CacheConfig::default();
        let cache = TwoLevelCache::new(
            remote.clone(),
            Some(local.clone()),
            bus.map(|b| b as Arc<dyn InvalidationBus>),
            InvalidationTracker::new(config.invalidation.record_ttl()),
            &config,
        );
        Instance { cache, local }
    }

    #[tokio::test]
    async fn test_save_then_get_round_trips_for_every_strategy() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);

        for (i, strategy) in ALL_STRATEGIES.into_iter().enumerate() {
            let key = format!("user-{}", i);
            node.cache
                .save("user", &key, &alice(), 600, strategy)
                .await
                .unwrap();
            let got: Option<User> = node.cache.get("user", &key, strategy).await;
            assert_eq!(got, Some(alice()), "strategy {:?}", strategy);
        }
    }

    #[tokio::test]
    async fn test_strategies_touch_the_right_stores() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);

        node.cache
            .save("user", "local", &alice(), 600, CacheStrategy::LocalOnly)
            .await
            .unwrap();
        assert!(remote.raw("user:local").is_none());
        assert!(node.local.get("user", "local").await.is_some());

        node.cache
            .save("user", "remote", &alice(), 600, CacheStrategy::RemoteOnly)
            .await
            .unwrap();
        assert!(remote.raw("user:remote").is_some());
        assert!(node.local.get("user", "remote").await.is_none());

        node.cache
            .save("user", "both", &alice(), 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();
        assert!(remote.raw("user:both").is_some());
        assert!(node.local.get("user", "both").await.is_some());
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_local_with_shorter_ttl() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        let entry = CacheEntry::new("user:1", alice(), 1000);
        remote.seed("user:1", &serde_json::to_string(&entry).unwrap(), Some(1000));

        let got: Option<User> = node
            .cache
            .get("user", "1", CacheStrategy::RemoteSyncToLocal)
            .await;
        assert_eq!(got, Some(alice()));
        assert!(node.local.get("user", "1").await.is_some());

        let stats = node.cache.stats();
        assert_eq!(stats.remote_hits, 1);
        assert_eq!(stats.backfills, 1);

        // Second read is served locally without touching the remote store
        let remote_gets = remote.get_count();
        let again: Option<User> = node
            .cache
            .get("user", "1", CacheStrategy::RemoteSyncToLocal)
            .await;
        assert_eq!(again, Some(alice()));
        assert_eq!(remote.get_count(), remote_gets);
        assert_eq!(node.cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_backfill_ttl_never_exceeds_remaining_remote_ttl() {
        let remote = MemoryRemoteStore::new();
        let recording = crate::testing::RecordingLocalStore::new();
        let config = CacheConfig::default();
        let cache = TwoLevelCache::new(
            remote.clone(),
            Some(recording.clone()),
            None,
            InvalidationTracker::new(config.invalidation.record_ttl()),
            &config,
        );

        for (key, ttl) in [("short", 120u64), ("long", 3600u64)] {
            let entry = CacheEntry::new(format!("user:{}", key), alice(), 7200);
            remote.seed(
                &format!("user:{}", key),
                &serde_json::to_string(&entry).unwrap(),
                Some(ttl),
            );
            let _: Option<User> = cache.get("user", key, CacheStrategy::LocalAndRemote).await;
        }

        let puts = recording.puts();
        assert_eq!(puts.len(), 2);
        assert!(puts[0].2 <= 120);
        assert!(puts[1].2 <= 3600);
        assert!(puts[1].2 < 3600, "long-lived entries are shortened");
    }

    #[tokio::test]
    async fn test_backfill_skipped_after_newer_invalidation() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        let entry = CacheEntry::new("user:1", alice(), 600);
        let raw = serde_json::to_string(&entry).unwrap();
        remote.seed("user:1", &raw, Some(600));

        let read_at = Utc::now();
        node.cache
            .tracker()
            .record("user", "1", read_at + ChronoDuration::milliseconds(5))
            .await;

        node.cache.backfill("user", "1", raw, read_at).await;

        assert!(node.local.get("user", "1").await.is_none());
        assert_eq!(node.cache.stats().skipped_backfills, 1);
    }

    #[tokio::test]
    async fn test_backfill_after_older_invalidation_rearms_entry() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        let entry = CacheEntry::new("user:1", alice(), 600);
        let raw = serde_json::to_string(&entry).unwrap();
        remote.seed("user:1", &raw, Some(600));

        node.cache
            .tracker()
            .record("user", "1", Utc::now() - ChronoDuration::seconds(10))
            .await;

        node.cache.backfill("user", "1", raw, Utc::now()).await;

        assert!(node.local.get("user", "1").await.is_some());
        assert!(node.cache.tracker().get("user", "1").await.is_none());
    }

    #[tokio::test]
    async fn test_slow_read_cannot_backfill_over_own_write() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);

        for strategy in [CacheStrategy::LocalAndRemote, CacheStrategy::RemoteSyncToLocal] {
            let old = serde_json::to_string(&CacheEntry::new("user:1", "old", 600)).unwrap();
            remote.seed("user:1", &old, Some(600));

            let read_at = Utc::now();
            node.cache
                .save("user", "1", &"new", 600, strategy)
                .await
                .unwrap();
            node.cache.backfill("user", "1", old, read_at).await;

            let got: Option<String> = node.cache.get("user", "1", strategy).await;
            assert_eq!(got.as_deref(), Some("new"), "strategy {:?}", strategy);
        }
        assert_eq!(node.cache.stats().skipped_backfills, 2);
    }

    #[tokio::test]
    async fn test_slow_read_cannot_resurrect_own_delete() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        node.cache
            .save("user", "1", &alice(), 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();
        let old = remote.raw("user:1").unwrap();

        let read_at = Utc::now();
        node.cache
            .delete("user", "1", CacheStrategy::LocalAndRemote)
            .await;
        remote.seed("user:1", &old, Some(600));
        node.cache.backfill("user", "1", old, read_at).await;

        assert!(node.local.get("user", "1").await.is_none());
    }

    #[tokio::test]
    async fn test_reads_after_own_write_still_backfill() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        node.cache
            .save("user", "1", &alice(), 600, CacheStrategy::RemoteOnly)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let got: Option<User> = node
            .cache
            .get("user", "1", CacheStrategy::LocalAndRemote)
            .await;
        assert_eq!(got, Some(alice()));
        assert!(node.local.get("user", "1").await.is_some());
        assert_eq!(node.cache.stats().backfills, 1);
    }

    #[tokio::test]
    async fn test_huge_ttl_round_trips() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);

        for (i, ttl) in [1u64 << 62, u64::MAX].into_iter().enumerate() {
            for strategy in ALL_STRATEGIES {
                let key = format!("big-{}-{:?}", i, strategy);
                node.cache
                    .save("user", &key, &"v", ttl, strategy)
                    .await
                    .unwrap();
                let got: Option<String> = node.cache.get("user", &key, strategy).await;
                assert_eq!(got.as_deref(), Some("v"), "ttl {} {:?}", ttl, strategy);
            }
        }
    }

    #[tokio::test]
    async fn test_remote_write_invalidates_other_instances() {
        let remote = MemoryRemoteStore::new();
        let bus = Arc::new(LocalInvalidationBus::default());
        let a = instance(&remote, Some(bus.clone()));
        let b = instance(&remote, Some(bus.clone()));

        a.cache
            .save("user", "1", &alice(), 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();
        // Let b observe the first write's invalidation before it reads
        let b_tracker = b.cache.tracker().clone();
        assert!(eventually(|| async { b_tracker.get("user", "1").await.is_some() }).await);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let on_b: Option<User> = b.cache.get("user", "1", CacheStrategy::LocalAndRemote).await;
        assert_eq!(on_b, Some(alice()));
        assert!(b.local.get("user", "1").await.is_some());

        let bob = User {
            id: 1,
            name: "bob".to_owned(),
        };
        a.cache
            .save("user", "1", &bob, 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();

        let b_local = b.local.clone();
        assert!(eventually(|| async { b_local.get("user", "1").await.is_none() }).await);
        let on_b: Option<User> = b.cache.get("user", "1", CacheStrategy::LocalAndRemote).await;
        assert_eq!(on_b, Some(bob.clone()));

        // The writer keeps its own fresh local copy
        let on_a: Option<User> = a.cache.get("user", "1", CacheStrategy::LocalOnly).await;
        assert_eq!(on_a, Some(bob));
    }

    #[tokio::test]
    async fn test_get_or_load_loads_once_and_caches() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        let calls = AtomicUsize::new(0);

        for strategy in ALL_STRATEGIES {
            calls.store(0, Ordering::SeqCst);
            let key = format!("{:?}", strategy);
            for _ in 0..3 {
                let value = node
                    .cache
                    .get_or_load(
                        "user",
                        &key,
                        || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, CacheError>(Some(alice()))
                        },
                        600,
                        strategy,
                    )
                    .await
                    .unwrap();
                assert_eq!(value, Some(alice()));
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1, "strategy {:?}", strategy);
        }
    }

    #[tokio::test]
    async fn test_get_or_load_does_not_cache_none() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value: Option<User> = node
                .cache
                .get_or_load(
                    "user",
                    "ghost",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, CacheError>(None)
                    },
                    600,
                    CacheStrategy::LocalAndRemote,
                )
                .await
                .unwrap();
            assert_eq!(value, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_or_load_surfaces_loader_error() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);

        let result: Result<Option<User>> = node
            .cache
            .get_or_load(
                "user",
                "1",
                || async { Err::<Option<User>, _>(CacheError::Unavailable("db down".to_owned())) },
                600,
                CacheStrategy::RemoteOnly,
            )
            .await;
        assert!(matches!(result, Err(CacheError::Backend(_))));
    }

    #[tokio::test]
    async fn test_remote_outage_is_a_miss_and_local_keeps_working() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        remote.set_offline(true);

        let got: Option<User> = node.cache.get("user", "1", CacheStrategy::RemoteOnly).await;
        assert_eq!(got, None);

        node.cache
            .save("user", "1", &alice(), 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();
        let got: Option<User> = node.cache.get("user", "1", CacheStrategy::LocalAndRemote).await;
        assert_eq!(got, Some(alice()));

        assert_eq!(node.cache.delete("user", "1", CacheStrategy::RemoteOnly).await, 0);
        assert!(node.cache.stats().store_errors >= 3);
    }

    #[tokio::test]
    async fn test_delete_missing_key_returns_zero() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        for strategy in ALL_STRATEGIES {
            assert_eq!(node.cache.delete("user", "nobody", strategy).await, 0);
        }
    }

    #[tokio::test]
    async fn test_delete_counts_removed_copies() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        node.cache
            .save("user", "1", &alice(), 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();

        assert_eq!(
            node.cache
                .delete("user", "1", CacheStrategy::LocalAndRemote)
                .await,
            2
        );
        let got: Option<User> = node.cache.get("user", "1", CacheStrategy::LocalAndRemote).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_works_without_local_store() {
        let remote = MemoryRemoteStore::new();
        let config = CacheConfig::default();
        let cache = TwoLevelCache::new(
            remote.clone(),
            None,
            None,
            InvalidationTracker::new(config.invalidation.record_ttl()),
            &config,
        );

        cache
            .save("user", "1", &alice(), 600, CacheStrategy::RemoteSyncToLocal)
            .await
            .unwrap();
        let got: Option<User> = cache.get("user", "1", CacheStrategy::RemoteSyncToLocal).await;
        assert_eq!(got, Some(alice()));
        let got: Option<User> = cache.get("user", "1", CacheStrategy::LocalOnly).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_corrupt_remote_entry_is_deleted() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        remote.seed("user:1", "not json", Some(600));

        let got: Option<User> = node.cache.get("user", "1", CacheStrategy::RemoteOnly).await;
        assert_eq!(got, None);
        assert!(remote.raw("user:1").is_none());
    }

    #[tokio::test]
    async fn test_expire_updates_remote_and_evicts_local() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        node.cache
            .save("user", "1", &alice(), 600, CacheStrategy::LocalAndRemote)
            .await
            .unwrap();

        assert!(node.cache.expire("user", "1", 30).await);
        assert!(node.local.get("user", "1").await.is_none());
        assert!(remote.ttl("user:1").await.unwrap() <= 30);
        assert!(!node.cache.expire("user", "missing", 30).await);
    }

    #[tokio::test]
    async fn test_clear_module() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        for key in ["1", "2", "3"] {
            node.cache
                .save("user", key, &alice(), 600, CacheStrategy::LocalAndRemote)
                .await
                .unwrap();
        }
        node.cache
            .save("order", "1", &alice(), 600, CacheStrategy::RemoteOnly)
            .await
            .unwrap();

        assert_eq!(node.cache.clear_module("user").await, 3);
        assert!(node.local.get("user", "2").await.is_none());
        assert!(remote.raw("order:1").is_some());
    }

    #[tokio::test]
    async fn test_short_lived_local_entry_expires() {
        let remote = MemoryRemoteStore::new();
        let node = instance(&remote, None);
        node.cache
            .save("user", "1", &alice(), 1, CacheStrategy::LocalOnly)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let got: Option<User> = node.cache.get("user", "1", CacheStrategy::LocalOnly).await;
        assert_eq!(got, None);
    }

    #[test]
    fn test_strategy_serde_names() {
        assert_eq!(
            serde_json::to_string(&CacheStrategy::RemoteSyncToLocal).unwrap(),
            "\"REMOTE_SYNC_TO_LOCAL\""
        );
        let parsed: CacheStrategy = serde_json::from_str("\"LOCAL_AND_REMOTE\"").unwrap();
        assert_eq!(parsed, CacheStrategy::LocalAndRemote);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            local_hits: 3,
            remote_hits: 1,
            misses: 4,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
