//! Explicit wiring of the cache components

use std::sync::Arc;

use tracing::info;

use crate::{
    CacheConfig, CacheError,
    error::Result,
    invalidation::{InvalidationBus, InvalidationTracker, RedisInvalidationBus},
    local::{LocalStore, MokaLocalStore},
    protection::PenetrationGuard,
    remote::{RedisRemoteStore, RemoteStore},
    two_level_cache::TwoLevelCache,
    warmup::{WarmupHandle, WarmupLoader},
};

/// Coordinator, guard and warmup loader sharing one set of stores
pub struct TieredCache {
    config: CacheConfig,
    cache: Arc<TwoLevelCache>,
    guard: Arc<PenetrationGuard>,
    warmup: Option<WarmupLoader>,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::default()
    }

    /// Wire Redis for the remote store and the invalidation bus, and Moka
    /// for the local store
    pub async fn connect_redis(redis_url: &str, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let client = redis::Client::open(redis_url)?;
        let remote = RedisRemoteStore::connect(client.clone()).await?;

        let mut builder = Self::builder().remote(Arc::new(remote));
        if config.invalidation.enabled {
            let bus =
                RedisInvalidationBus::connect(client, config.invalidation.channel.clone()).await?;
            builder = builder.bus(Arc::new(bus));
        }
        info!("Connected cache to Redis at {}", redis_url);
        builder.config(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TwoLevelCache> {
        &self.cache
    }

    pub fn guard(&self) -> &Arc<PenetrationGuard> {
        &self.guard
    }

    /// `None` without a local store
    pub fn warmup(&self) -> Option<&WarmupLoader> {
        self.warmup.as_ref()
    }

    /// Warm the configured modules in the background.
    ///
    /// `None` when warmup is disabled or there is no local store.
    pub fn start_warmup(&self) -> Option<WarmupHandle> {
        let loader = self.warmup.as_ref()?;
        if !self.config.warmup.enabled {
            return None;
        }
        Some(loader.spawn(self.config.warmup.modules.clone()))
    }
}

enum LocalChoice {
    Default,
    Custom(Arc<dyn LocalStore>),
    Disabled,
}

pub struct TieredCacheBuilder {
    config: CacheConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    local: LocalChoice,
    bus: Option<Arc<dyn InvalidationBus>>,
}

impl Default for TieredCacheBuilder {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            remote: None,
            local: LocalChoice::Default,
            bus: None,
        }
    }
}

impl TieredCacheBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use this local store instead of a [`MokaLocalStore`] sized from the
    /// config
    pub fn local(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = LocalChoice::Custom(local);
        self
    }

    /// Run remote-only; local strategies degrade to the remote store
    pub fn without_local(mut self) -> Self {
        self.local = LocalChoice::Disabled;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<TieredCache> {
        let Self {
            config,
            remote,
            local,
            bus,
        } = self;
        config.validate()?;
        let remote =
            remote.ok_or_else(|| CacheError::Config("a remote store is required".to_owned()))?;

        let local: Option<Arc<dyn LocalStore>> = match local {
            LocalChoice::Default => Some(Arc::new(MokaLocalStore::new(config.local.max_capacity))),
            LocalChoice::Custom(local) => Some(local),
            LocalChoice::Disabled => None,
        };

        let tracker = InvalidationTracker::new(config.invalidation.record_ttl());
        let cache = Arc::new(TwoLevelCache::new(
            Arc::clone(&remote),
            local.clone(),
            bus,
            tracker.clone(),
            &config,
        ));
        let guard = Arc::new(PenetrationGuard::new(
            Arc::clone(&cache),
            config.penetration_protection.clone(),
        ));
        let warmup =
            local.map(|local| WarmupLoader::new(remote, local, tracker, config.warmup.clone()));

        Ok(TieredCache {
            config,
            cache,
            guard,
            warmup,
        })
    }
}
