use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;

use super::{
    error::{CacheError, CacheResult},
    traits::{Cache, WindowCounters},
};
use crate::config::RedisCacheConfig;

/// Lua script for atomic increment that preserves existing TTL.
/// Returns the new value after increment.
///
/// Only sets TTL when the key has no expiry (TTL < 0). This prevents
/// repeated increments from extending a period bucket's lifetime.
const INCR_PRESERVE_TTL_SCRIPT: &str = r#"
local key = KEYS[1]
local delta = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local new_value = redis.call('INCRBY', key, delta)
-- TTL returns -1 for no expiry after INCRBY
if ttl > 0 and redis.call('TTL', key) < 0 then
    redis.call('EXPIRE', key, ttl)
end
return new_value
"#;

/// Lua script for atomic rate-window fold with lazy reset.
/// Returns [window_start_ms, requests, tokens, cost].
///
/// The window is a hash {start, requests, tokens, cost}. When the stored
/// window is missing or older than the duration, it restarts at now
/// holding only this event's counts; otherwise the counts accumulate.
const WINDOW_ADD_SCRIPT: &str = r#"
local key = KEYS[1]
local duration_ms = tonumber(ARGV[1])
local requests = tonumber(ARGV[2])
local tokens = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now_ms = tonumber(ARGV[5])

local start = tonumber(redis.call('HGET', key, 'start') or '-1')
if start < 0 or now_ms - start >= duration_ms then
    redis.call('HSET', key, 'start', now_ms, 'requests', requests, 'tokens', tokens, 'cost', cost)
    redis.call('PEXPIRE', key, duration_ms)
    return {now_ms, requests, tokens, cost}
end

local r = redis.call('HINCRBY', key, 'requests', requests)
local t = redis.call('HINCRBY', key, 'tokens', tokens)
local c = redis.call('HINCRBY', key, 'cost', cost)
return {start, r, t, c}
"#;

/// Redis-backed cache for multi-node deployments.
///
/// All counter and window mutations run server-side (INCRBY or Lua), so
/// concurrent writers from any node never lose updates.
pub struct RedisCache {
    client: redis::Client,
    key_prefix: String,
    connect_timeout: Duration,
}

impl RedisCache {
    pub fn from_config(config: &RedisCacheConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        })
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        Ok(self
            .client
            .get_multiplexed_async_connection_with_timeouts(
                self.connect_timeout,
                self.connect_timeout,
            )
            .await?)
    }
}

fn window_from_parts(parts: (i64, i64, i64, i64)) -> CacheResult<WindowCounters> {
    let window_start = DateTime::from_timestamp_millis(parts.0)
        .ok_or_else(|| CacheError::Internal(format!("bad window start {}", parts.0)))?;
    Ok(WindowCounters {
        window_start,
        requests: parts.1,
        tokens: parts.2,
        cost_microcents: parts.3,
    })
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed_key(key)).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed_key(key)).arg(value).arg("NX");
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_i64(&self, key: &str) -> CacheResult<Option<i64>> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = redis::cmd("GET")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(INCR_PRESERVE_TTL_SCRIPT);
        let new_value: i64 = script
            .key(self.prefixed_key(key))
            .arg(delta)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(new_value)
    }

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(fields)
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = self.prefixed_key(key);
        let mut conn = self.connection().await?;

        // Replace rather than merge, so dropped optional fields disappear
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(&key).ignore();
        let mut hset = redis::cmd("HSET");
        hset.arg(&key);
        for (field, value) in fields {
            hset.arg(field).arg(value);
        }
        pipe.add_command(hset).ignore();
        if !ttl.is_zero() {
            pipe.cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
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
        let mut conn = self.connection().await?;
        let script = redis::Script::new(WINDOW_ADD_SCRIPT);
        let parts: (i64, i64, i64, i64) = script
            .key(self.prefixed_key(key))
            .arg(duration.as_millis() as u64)
            .arg(requests)
            .arg(tokens)
            .arg(cost_microcents)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        window_from_parts(parts)
    }

    async fn window_get(
        &self,
        key: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> CacheResult<Option<WindowCounters>> {
        let fields = self.hash_get_all(key).await?;
        let Some(start) = fields.get("start") else {
            return Ok(None);
        };
        let start_ms: i64 = start
            .parse()
            .map_err(|_| CacheError::Internal(format!("bad window start '{start}'")))?;
        let parse = |name: &str| -> i64 {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        let window =
            window_from_parts((start_ms, parse("requests"), parse("tokens"), parse("cost")))?;
        if window.is_live(duration, now) {
            Ok(Some(window))
        } else {
            Ok(None)
        }
    }

    async fn list_push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = self.prefixed_key(key);
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("LPUSH").arg(&key).arg(value).ignore();
        pipe.cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(max_len.saturating_sub(1) as i64)
            .ignore();
        if !ttl.is_zero() {
            pipe.cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_recent(&self, key: &str, count: usize) -> CacheResult<Vec<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let entries: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(self.prefixed_key(key))
            .arg(0)
            .arg(count.saturating_sub(1) as i64)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }
}
