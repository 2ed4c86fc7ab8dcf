//! Remote (L2) store adapter
//!
//! A thin contract over the shared key-value store. The coordinator, guard
//! and warmup loader only ever talk to the remote store through
//! [`RemoteStore`], so any store that offers these primitives can stand in
//! for Redis.

use std::collections::HashSet;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::Result;

/// `ttl` result for a key that exists without an expiry
pub const TTL_NEVER: i64 = -1;
/// `ttl` result for a key that does not exist
pub const TTL_ABSENT: i64 = -2;

const SCAN_BATCH: usize = 500;

/// Contract for the shared key-value store
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, with an expiry when `ttl_seconds` is given
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    /// Delete a key, returning how many keys were removed
    async fn delete(&self, key: &str) -> Result<u64>;

    async fn delete_many(&self, keys: &[String]) -> Result<u64>;

    /// Set an expiry; `false` when the key does not exist
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool>;

    /// Remaining TTL in seconds, [`TTL_NEVER`] or [`TTL_ABSENT`]
    async fn ttl(&self, key: &str) -> Result<i64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys matching a glob pattern
    async fn scan(&self, pattern: &str) -> Result<HashSet<String>>;

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool>;

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<()>;
}

/// [`RemoteStore`] backed by Redis through a shared connection manager
#[derive(Clone)]
pub struct RedisRemoteStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisRemoteStore {
    pub async fn connect(redis_client: redis::Client) -> Result<Self> {
        let conn = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { conn })
    }

    pub fn from_connection_manager(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl_seconds {
            Some(ttl) if ttl > 0 => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
            _ => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.del::<_, u64>(key).await?)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.del::<_, u64>(keys).await?)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .query_async::<bool>(&mut conn)
            .await?;
        Ok(updated)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.ttl::<_, i64>(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn scan(&self, pattern: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn.clone();
        let mut keys = HashSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!("SCAN {} matched {} keys", pattern, keys.len());
        Ok(keys)
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let bit = redis::cmd("GETBIT")
            .arg(key)
            .arg(offset)
            .query_async::<u8>(&mut conn)
            .await?;
        Ok(bit == 1)
    }

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SETBIT")
            .arg(key)
            .arg(offset)
            .arg(u8::from(value))
            .query_async::<u8>(&mut conn)
            .await?;
        Ok(())
    }
}
