//! In-memory doubles for the store adapters, used by the unit tests

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{
    CacheError,
    error::Result,
    local::{LocalStore, MokaLocalStore},
    remote::{RemoteStore, TTL_ABSENT, TTL_NEVER},
};

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// Remote store with Redis-like expiry semantics that can be switched offline
#[derive(Default)]
pub struct MemoryRemoteStore {
    values: Mutex<HashMap<String, StoredValue>>,
    bits: Mutex<HashMap<String, HashSet<u64>>>,
    offline: AtomicBool,
    gets: AtomicUsize,
    get_delay: Mutex<Option<Duration>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent call fail as if the store were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every `get` sleep before answering
    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    /// Number of `get` calls served so far
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Insert a value directly with a TTL, bypassing the cache layers
    pub fn seed(&self, key: &str, value: &str, ttl_seconds: Option<u64>) {
        self.values.lock().unwrap().insert(
            key.to_owned(),
            StoredValue {
                value: value.to_owned(),
                expires_at: ttl_seconds
                    .and_then(|t| Instant::now().checked_add(Duration::from_secs(t))),
            },
        );
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap();
        values
            .get(key)
            .filter(|v| v.is_live())
            .map(|v| v.value.clone())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("remote store offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, segment) in segments.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        self.check_online()?;
        self.seed(key, value, ttl_seconds.filter(|t| *t > 0));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.check_online()?;
        let removed = self
            .values
            .lock()
            .unwrap()
            .remove(key)
            .filter(|v| v.is_live())
            .is_some();
        let removed_bits = self.bits.lock().unwrap().remove(key).is_some();
        Ok(u64::from(removed || removed_bits))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut count = 0;
        for key in keys {
            count += self.delete(key).await?;
        }
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        self.check_online()?;
        let mut values = self.values.lock().unwrap();
        match values.get_mut(key).filter(|v| v.is_live()) {
            Some(v) => {
                v.expires_at = Instant::now().checked_add(Duration::from_secs(ttl_seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.check_online()?;
        let values = self.values.lock().unwrap();
        Ok(match values.get(key).filter(|v| v.is_live()) {
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
            Some(_) => TTL_NEVER,
            None => TTL_ABSENT,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.raw(key).is_some() || self.bits.lock().unwrap().contains_key(key))
    }

    async fn scan(&self, pattern: &str) -> Result<HashSet<String>> {
        self.check_online()?;
        let values = self.values.lock().unwrap();
        Ok(values
            .iter()
            .filter(|(k, v)| v.is_live() && glob_matches(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        self.check_online()?;
        let bits = self.bits.lock().unwrap();
        Ok(bits.get(key).is_some_and(|set| set.contains(&offset)))
    }

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<()> {
        self.check_online()?;
        let mut bits = self.bits.lock().unwrap();
        let set = bits.entry(key.to_owned()).or_default();
        if value {
            set.insert(offset);
        } else {
            set.remove(&offset);
        }
        Ok(())
    }
}

/// Local store that remembers the order and TTL of every `put`
pub struct RecordingLocalStore {
    inner: MokaLocalStore,
    puts: Mutex<Vec<(String, String, u64)>>,
}

impl RecordingLocalStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MokaLocalStore::new(1000),
            puts: Mutex::new(Vec::new()),
        })
    }

    /// `(region, key, ttl_seconds)` for every put, in call order
    pub fn puts(&self) -> Vec<(String, String, u64)> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalStore for RecordingLocalStore {
    async fn get(&self, region: &str, key: &str) -> Option<String> {
        self.inner.get(region, key).await
    }

    async fn put(&self, region: &str, key: &str, value: String, ttl_seconds: u64) {
        self.puts
            .lock()
            .unwrap()
            .push((region.to_owned(), key.to_owned(), ttl_seconds));
        self.inner.put(region, key, value, ttl_seconds).await;
    }

    async fn remove(&self, region: &str, key: &str) -> bool {
        self.inner.remove(region, key).await
    }
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("session:*", "session:abc"));
        assert!(glob_matches("session:*", "session:"));
        assert!(!glob_matches("session:*", "user:abc"));
        assert!(glob_matches("*:abc", "session:abc"));
        assert!(glob_matches("a*c*e", "abcde"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_memory_store_ttl_codes() {
        let store = MemoryRemoteStore::new();
        store.seed("forever", "v", None);
        store.seed("timed", "v", Some(100));

        assert_eq!(store.ttl("forever").await.unwrap(), TTL_NEVER);
        assert_eq!(store.ttl("missing").await.unwrap(), TTL_ABSENT);
        let ttl = store.ttl("timed").await.unwrap();
        assert!((98..=100).contains(&ttl));
    }

    #[tokio::test]
    async fn test_memory_store_offline() {
        let store = MemoryRemoteStore::new();
        store.set_offline(true);
        assert!(store.get("k").await.is_err());
        store.set_offline(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
