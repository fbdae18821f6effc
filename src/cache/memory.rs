use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use super::{
    error::CacheResult,
    traits::{Cache, WindowCounters},
};
use crate::config::MemoryCacheConfig;

struct CacheEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(data: Vec<u8>, expires_at: Option<Instant>) -> Self {
        Self {
            data,
            expires_at,
            last_accessed: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }
}

struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Window plus the duration it was last written with, so the eviction
/// sweep can tell a lapsed window from a live one.
struct WindowEntry {
    counters: WindowCounters,
    duration: Duration,
}

struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

struct LogEntry {
    items: VecDeque<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl LogEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

fn expiry(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}

fn window_expired(window: &WindowCounters, duration: Duration, now: DateTime<Utc>) -> bool {
    let limit = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    now.signed_duration_since(window.window_start) >= limit
}

/// In-memory cache implementation using DashMap for concurrent access.
///
/// # Multi-Node Deployments
///
/// **WARNING**: This cache is NOT suitable for multi-node deployments.
///
/// Each node maintains its own independent counters and index, so key
/// revocation and quota accumulation are per-node. For multi-node
/// deployments use the Redis cache, which shares state across nodes.
///
/// Counter, window, and log mutations are atomic per key: each mutates
/// under its DashMap entry lock, never read-then-write across await
/// points.
pub struct MemoryCache {
    data: Arc<DashMap<String, CacheEntry>>,
    counters: Arc<DashMap<String, CounterEntry>>,
    hashes: Arc<DashMap<String, HashEntry>>,
    windows: Arc<DashMap<String, WindowEntry>>,
    logs: Arc<DashMap<String, LogEntry>>,
    max_entries: usize,
    eviction_batch_size: usize,
}

impl MemoryCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            hashes: Arc::new(DashMap::new()),
            windows: Arc::new(DashMap::new()),
            logs: Arc::new(DashMap::new()),
            max_entries: config.max_entries,
            eviction_batch_size: config.eviction_batch_size.max(1),
        }
    }

    fn evict_if_needed(&self) {
        let total = self.data.len()
            + self.counters.len()
            + self.hashes.len()
            + self.windows.len()
            + self.logs.len();
        if total < self.max_entries {
            return;
        }

        // First pass: remove expired entries from every map. Date-labeled
        // counters and lapsed windows are reclaimed here rather than
        // lingering until a same-key write.
        let now = Utc::now();
        self.data.retain(|_, entry| !entry.is_expired());
        self.counters.retain(|_, entry| !entry.is_expired());
        self.hashes.retain(|_, entry| !entry.is_expired());
        self.windows
            .retain(|_, entry| !window_expired(&entry.counters, entry.duration, now));
        self.logs.retain(|_, entry| !entry.is_expired());

        let current_len = self.data.len();
        if current_len < self.max_entries {
            return;
        }

        // Still at capacity: evict least recently used entries
        let target_size = self.max_entries.saturating_sub(self.eviction_batch_size);
        let to_evict = current_len.saturating_sub(target_size);
        if to_evict == 0 {
            return;
        }

        let mut entries: Vec<_> = self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_accessed))
            .collect();
        entries.sort_by_key(|(_, last_accessed)| *last_accessed);

        for (key, _) in entries.into_iter().take(to_evict) {
            self.data.remove(&key);
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(mut entry) = self.data.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return Ok(None);
            }
            entry.touch();
            Ok(Some(entry.data.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.evict_if_needed();
        self.data
            .insert(key.to_string(), CacheEntry::new(value.to_vec(), expiry(ttl)));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.evict_if_needed();

        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(CacheEntry::new(value.to_vec(), expiry(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(e) => {
                e.insert(CacheEntry::new(value.to_vec(), expiry(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.data.remove(key);
        self.counters.remove(key);
        self.hashes.remove(key);
        self.windows.remove(key);
        self.logs.remove(key);
        Ok(())
    }

    async fn get_i64(&self, key: &str) -> CacheResult<Option<i64>> {
        if let Some(entry) = self.counters.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.counters.remove(key);
                return Ok(None);
            }
            Ok(Some(entry.value))
        } else {
            Ok(None)
        }
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        self.evict_if_needed();

        // Entry lock makes check-reset-add one atomic step per key. An
        // expired counter restarts at the delta; a live counter keeps its
        // original expiry so increments never extend the period.
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.is_expired() {
                    *entry = CounterEntry {
                        value: delta,
                        expires_at: expiry(ttl),
                    };
                } else {
                    entry.value += delta;
                    if entry.expires_at.is_none() {
                        entry.expires_at = expiry(ttl);
                    }
                }
                Ok(entry.value)
            }
            Entry::Vacant(e) => {
                e.insert(CounterEntry {
                    value: delta,
                    expires_at: expiry(ttl),
                });
                Ok(delta)
            }
        }
    }

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        if let Some(entry) = self.hashes.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.hashes.remove(key);
                return Ok(HashMap::new());
            }
            Ok(entry.fields.clone())
        } else {
            Ok(HashMap::new())
        }
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> CacheResult<()> {
        self.evict_if_needed();
        self.hashes.insert(
            key.to_string(),
            HashEntry {
                fields: fields.iter().cloned().collect(),
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn window_add(
        &self,
        key: &str,
        duration: Duration,
        requests: i64,
        tokens: i64,
        cost_microcents: i64,
        now: DateTime<Utc>,
    ) -> CacheResult<WindowCounters> {
        self.evict_if_needed();

        // The entry lock makes check-reset-add one atomic step per key
        match self.windows.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if window_expired(&entry.counters, duration, now) {
                    entry.counters = WindowCounters {
                        window_start: now,
                        requests,
                        tokens,
                        cost_microcents,
                    };
                } else {
                    entry.counters.requests += requests;
                    entry.counters.tokens += tokens;
                    entry.counters.cost_microcents += cost_microcents;
                }
                entry.duration = duration;
                Ok(entry.counters)
            }
            Entry::Vacant(e) => {
                let counters = WindowCounters {
                    window_start: now,
                    requests,
                    tokens,
                    cost_microcents,
                };
                e.insert(WindowEntry { counters, duration });
                Ok(counters)
            }
        }
    }

    async fn window_get(
        &self,
        key: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> CacheResult<Option<WindowCounters>> {
        match self.windows.get(key) {
            Some(entry) if !window_expired(&entry.counters, duration, now) => Ok(Some(entry.counters)),
            _ => Ok(None),
        }
    }

    async fn list_push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.evict_if_needed();
        match self.logs.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                if entry.is_expired() {
                    let mut items = VecDeque::new();
                    items.push_front(value.to_vec());
                    *entry = LogEntry {
                        items,
                        expires_at: expiry(ttl),
                    };
                } else {
                    entry.items.push_front(value.to_vec());
                    entry.items.truncate(max_len);
                }
            }
            Entry::Vacant(e) => {
                let mut items = VecDeque::new();
                items.push_front(value.to_vec());
                e.insert(LogEntry {
                    items,
                    expires_at: expiry(ttl),
                });
            }
        }
        Ok(())
    }

    async fn list_recent(&self, key: &str, count: usize) -> CacheResult<Vec<Vec<u8>>> {
        if let Some(entry) = self.logs.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.logs.remove(key);
                return Ok(Vec::new());
            }
            Ok(entry.items.iter().take(count).cloned().collect())
        } else {
            Ok(Vec::new())
        }
    }
}
