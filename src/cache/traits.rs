use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::CacheResult;

/// Counters for a sliding rate window.
///
/// Validity is lazy: the stored entry is logically zero once
/// `now >= window_start + duration`, regardless of the stored counts.
/// Readers must re-derive validity from `window_start`; writers reset the
/// window to the new event's counts when they find it expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounters {
    pub window_start: DateTime<Utc>,
    pub requests: i64,
    pub tokens: i64,
    pub cost_microcents: i64,
}

impl WindowCounters {
    pub fn is_live(&self, duration: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.window_start);
        age < chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
            && age >= chrono::Duration::zero()
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Get raw bytes from cache
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set raw bytes in cache with TTL (zero TTL means no expiration)
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Set raw bytes only if key doesn't exist (atomic set-if-not-exists).
    /// Returns true if the value was set, false if key already exists.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Delete a value from cache (data, counter, window, or log)
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Read a counter without mutating it. Missing counters read as None.
    async fn get_i64(&self, key: &str) -> CacheResult<Option<i64>>;

    /// Atomically increment a counter by delta, returning the new value.
    ///
    /// Single round trip; never read-then-write. The TTL is applied only
    /// when the counter has no expiry yet, so repeated increments within a
    /// period do not push the window out.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64>;

    /// Read all fields of a string-to-string hash. Missing key yields an
    /// empty map.
    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// Replace all fields of a string-to-string hash with TTL.
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> CacheResult<()>;

    /// Atomically fold one event into a rate window.
    ///
    /// If the stored window is missing or expired (`now >= start + duration`)
    /// the window restarts at `now` holding only this event's counts.
    /// Otherwise the counts are added to the live window. Returns the
    /// resulting window.
    async fn window_add(
        &self,
        key: &str,
        duration: Duration,
        requests: i64,
        tokens: i64,
        cost_microcents: i64,
        now: DateTime<Utc>,
    ) -> CacheResult<WindowCounters>;

    /// Read a rate window. Returns None when the stored window is missing
    /// or already expired relative to `now`.
    async fn window_get(
        &self,
        key: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> CacheResult<Option<WindowCounters>>;

    /// Push an entry to the head of a bounded list, trimming to `max_len`.
    async fn list_push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> CacheResult<()>;

    /// Read up to `count` most recent entries of a bounded list (newest
    /// first).
    async fn list_recent(&self, key: &str, count: usize) -> CacheResult<Vec<Vec<u8>>>;
}
