//! Cached entry model and the local TTL policy
//!
//! Entries are serialized to JSON in both stores and copied, never shared,
//! when they cross from the remote store into the local one.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Remote TTLs at or below this are mirrored into the local store unchanged
const SHORT_TTL_THRESHOLD_SECS: i64 = 300;
/// Lower bound for a shortened local TTL
const MIN_LOCAL_TTL_SECS: i64 = 60;
const LOCAL_TTL_RATIO: f64 = 0.8;

/// A value together with the metadata needed to reason about its lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub created_at: DateTime<Utc>,
    /// Lifetime in seconds counted from `created_at`; `<= 0` never expires.
    /// A lifetime too large to represent as a date also never expires.
    pub expire_seconds: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, data: T, expire_seconds: i64) -> Self {
        Self {
            key: key.into(),
            data,
            created_at: Utc::now(),
            expire_seconds,
        }
    }

    pub fn never_expires(&self) -> bool {
        self.expire_seconds <= 0
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Seconds left before expiry, `-1` for entries that never expire
    pub fn remaining_seconds(&self) -> i64 {
        self.remaining_seconds_at(Utc::now())
    }

    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        match self.expires_at() {
            Some(at) => (at - now).num_seconds().max(0),
            None => -1,
        }
    }

    /// Push expiry out by `delta` seconds (negative shortens it)
    pub fn extend(&mut self, delta: i64) {
        if !self.never_expires() {
            self.expire_seconds = self.expire_seconds.saturating_add(delta).max(1);
        }
    }

    /// Restart the lifetime from now with a new duration
    pub fn reset_expiry(&mut self, new_seconds: i64) {
        self.created_at = Utc::now();
        self.expire_seconds = new_seconds;
    }

    /// `None` when the entry never expires
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.never_expires() {
            return None;
        }
        TimeDelta::try_seconds(self.expire_seconds)
            .and_then(|lifetime| self.created_at.checked_add_signed(lifetime))
    }
}

/// Clamp a caller-supplied lifetime into the signed range entries use
pub(crate) fn ttl_to_i64(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

/// Local TTL for a value whose remote copy has `remote_ttl` seconds left.
///
/// Long-lived entries are shortened to 80% of the remote TTL (never below
/// 60s and never above the remote TTL); short-lived ones are mirrored as-is.
/// The result never exceeds `remote_ttl`.
pub fn derive_local_ttl(remote_ttl: i64) -> i64 {
    if remote_ttl <= 0 {
        return 0;
    }
    if remote_ttl > SHORT_TTL_THRESHOLD_SECS {
        let shortened = (remote_ttl as f64 * LOCAL_TTL_RATIO) as i64;
        shortened.clamp(MIN_LOCAL_TTL_SECS, remote_ttl)
    } else {
        remote_ttl
    }
}
