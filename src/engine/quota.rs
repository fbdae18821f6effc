//! Quota state reads.
//!
//! The engine reports accumulated cost and rate-window state; the relay in
//! front decides whether a request may proceed. All reads go to the hot
//! cache, which is authoritative for counters. A missing bucket reads as
//! zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{EngineResult, MeteringEngine};
use crate::cache::{CacheKeys, Period};
use crate::models::Key;

/// Accumulated cost per period for a key, in microcents.
///
/// Each value is the current period-label's bucket; past labels are not
/// summed (except lifetime, which is a single bucket).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CostSnapshot {
    pub daily_microcents: i64,
    pub weekly_microcents: i64,
    pub monthly_microcents: i64,
    pub lifetime_microcents: i64,
    pub opus_weekly_microcents: i64,
}

/// Live rate-window state for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateWindowState {
    /// Seconds until the window expires. Strictly positive for a live
    /// window.
    pub remaining_seconds: i64,
    pub requests: i64,
    pub tokens: i64,
    pub cost_microcents: i64,
}

impl MeteringEngine {
    /// Read the current cost buckets for a key.
    pub async fn cost_snapshot(&self, key_id: Uuid) -> EngineResult<CostSnapshot> {
        let now = Utc::now();
        Ok(CostSnapshot {
            daily_microcents: self.read_bucket(Period::Daily, key_id, now).await?,
            weekly_microcents: self.read_bucket(Period::Weekly, key_id, now).await?,
            monthly_microcents: self.read_bucket(Period::Monthly, key_id, now).await?,
            lifetime_microcents: self.read_bucket(Period::Lifetime, key_id, now).await?,
            opus_weekly_microcents: self.read_bucket(Period::OpusWeekly, key_id, now).await?,
        })
    }

    /// Read the live rate window for a key.
    ///
    /// Returns `None` when the key has no window configured, the window has
    /// never been written, or the stored window has lapsed.
    pub async fn rate_window_state(&self, key_id: Uuid) -> EngineResult<Option<RateWindowState>> {
        let Some(key) = self.load_key(key_id).await? else {
            return Ok(None);
        };
        self.rate_window_for(&key, Utc::now()).await
    }

    pub(crate) async fn rate_window_for(
        &self,
        key: &Key,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<RateWindowState>> {
        let Some(spec) = key.rate_window else {
            return Ok(None);
        };
        let duration = std::time::Duration::from_secs(spec.duration_minutes.max(0) as u64 * 60);

        let Some(window) = self
            .cache()
            .window_get(&CacheKeys::rate_window(key.id), duration, now)
            .await?
        else {
            return Ok(None);
        };

        let elapsed = now.signed_duration_since(window.window_start).num_seconds();
        let remaining = spec.duration_minutes.max(0) * 60 - elapsed;

        Ok(Some(RateWindowState {
            remaining_seconds: remaining,
            requests: window.requests,
            tokens: window.tokens,
            cost_microcents: window.cost_microcents,
        }))
    }

    async fn read_bucket(
        &self,
        period: Period,
        key_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let label = period.label(now, self.config().utc_offset_hours);
        let value = self
            .cache()
            .get_i64(&CacheKeys::cost(period, key_id, &label))
            .await?;
        Ok(value.unwrap_or(0))
    }
}
