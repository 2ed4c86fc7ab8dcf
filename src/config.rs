//! Cache configuration
//!
//! All sections deserialize from camelCase keys, so the host can feed the
//! same document it uses for the rest of its settings:
//!
//! ```json
//! {
//!   "penetrationProtection": {
//!     "enabled": true,
//!     "enableBloomFilter": true,
//!     "rateLimit": { "enabled": true, "windowSizeSeconds": 1, "requestsPerSecond": 100 }
//!   },
//!   "warmup": { "enabled": true, "modules": ["session"] }
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CacheError, error::Result};

/// Top-level configuration for the two-level cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub local: LocalConfig,
    pub invalidation: InvalidationConfig,
    pub penetration_protection: PenetrationProtectionConfig,
    pub warmup: WarmupConfig,
}

/// In-process (L1) store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalConfig {
    /// Maximum number of entries per region
    pub max_capacity: u64,
    /// TTL used when backfilling an entry whose remote copy never expires
    pub default_ttl_seconds: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            default_ttl_seconds: 300,
        }
    }
}

/// Cross-instance invalidation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvalidationConfig {
    pub enabled: bool,
    /// Pub/sub channel shared by every instance
    pub channel: String,
    /// How long an invalidation record is kept by the tracker. Must outlive
    /// the slowest expected remote read.
    pub record_ttl_seconds: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "cache:invalidation".to_owned(),
            record_ttl_seconds: 120,
        }
    }
}

impl InvalidationConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_seconds)
    }
}

/// Penetration protection: rate limiting, existence filter, null markers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PenetrationProtectionConfig {
    pub enabled: bool,
    pub enable_bloom_filter: bool,
    /// Number of bits in each module's existence filter
    pub bloom_filter_size: u64,
    /// Lifetime of a null marker, independent of real-data TTLs
    pub null_value_expire_seconds: u64,
    pub rate_limit: RateLimitConfig,
}

impl Default for PenetrationProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_bloom_filter: false,
            bloom_filter_size: 1 << 24,
            null_value_expire_seconds: 60,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Per-(module, key) request budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_size_seconds: u64,
    pub requests_per_second: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size_seconds: 1,
            requests_per_second: 100,
        }
    }
}

impl RateLimitConfig {
    /// Requests allowed within one window
    pub fn budget(&self) -> u64 {
        self.requests_per_second
            .saturating_mul(self.window_size_seconds)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_size_seconds)
    }
}

/// Startup warmup of the local store from the remote store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WarmupConfig {
    pub enabled: bool,
    pub max_count: usize,
    /// Candidates with this much remaining TTL or less are not worth loading
    pub min_ttl_seconds: i64,
    pub batch_size: usize,
    pub thread_pool_size: usize,
    pub batch_timeout_seconds: u64,
    /// Modules whose remote entries are warmed
    pub modules: Vec<String>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_count: 1000,
            min_ttl_seconds: 300,
            batch_size: 50,
            thread_pool_size: 4,
            batch_timeout_seconds: 30,
            modules: Vec::new(),
        }
    }
}

impl WarmupConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_seconds)
    }
}

impl CacheConfig {
    /// Parse a JSON configuration document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.local.max_capacity == 0 {
            return Err(CacheError::Config(
                "local.maxCapacity must be greater than 0".to_owned(),
            ));
        }

        if self.invalidation.enabled && self.invalidation.channel.is_empty() {
            return Err(CacheError::Config(
                "invalidation.channel must not be empty".to_owned(),
            ));
        }

        let protection = &self.penetration_protection;
        if protection.enabled && protection.enable_bloom_filter && protection.bloom_filter_size == 0
        {
            return Err(CacheError::Config(
                "penetrationProtection.bloomFilterSize must be greater than 0".to_owned(),
            ));
        }

        if protection.enabled && protection.rate_limit.enabled {
            if protection.rate_limit.window_size_seconds == 0 {
                return Err(CacheError::Config(
                    "penetrationProtection.rateLimit.windowSizeSeconds must be greater than 0"
                        .to_owned(),
                ));
            }
            if protection.rate_limit.requests_per_second == 0 {
                return Err(CacheError::Config(
                    "penetrationProtection.rateLimit.requestsPerSecond must be greater than 0"
                        .to_owned(),
                ));
            }
        }

        if self.warmup.enabled {
            if self.warmup.batch_size == 0 {
                return Err(CacheError::Config(
                    "warmup.batchSize must be greater than 0".to_owned(),
                ));
            }
            if self.warmup.thread_pool_size == 0 {
                return Err(CacheError::Config(
                    "warmup.threadPoolSize must be greater than 0".to_owned(),
                ));
            }
        }

        Ok(())
    }
}
