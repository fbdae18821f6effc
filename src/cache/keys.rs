use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

/// Cost accumulation period.
///
/// Each period addresses its own bucket key, so a new period label is a
/// fresh zero-valued bucket and no explicit reset ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
    Lifetime,
    /// Model-class-specific weekly bucket, layered on top of `Weekly`
    OpusWeekly,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::Lifetime => "lifetime",
            Period::OpusWeekly => "opus-weekly",
        }
    }

    /// Bucket label for `at`, shifted by the configured UTC offset.
    ///
    /// Daily is `%Y-%m-%d`, weekly is the ISO-8601 `YYYY-Www` label
    /// (nearest-Thursday rule), monthly is `%Y-%m`, lifetime is a single
    /// `total` bucket. The offset shifts the wall clock before the label is
    /// derived, so a `+8` deployment rolls its buckets at its own midnight.
    pub fn label(&self, at: DateTime<Utc>, utc_offset_hours: i32) -> String {
        let shifted = at + chrono::Duration::hours(utc_offset_hours as i64);
        match self {
            Period::Daily => shifted.format("%Y-%m-%d").to_string(),
            Period::Weekly | Period::OpusWeekly => {
                let week = shifted.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Period::Monthly => shifted.format("%Y-%m").to_string(),
            Period::Lifetime => "total".to_string(),
        }
    }

    /// Fixed TTL for this period's buckets.
    ///
    /// Uses a full period duration rather than time-until-period-end, so a
    /// bucket created just before a boundary cannot expire mid-request.
    /// Since bucket keys embed the period label, a stale bucket never
    /// counts against the next period; it just ages out.
    pub fn bucket_ttl(&self) -> Duration {
        match self {
            Period::Daily => Duration::from_secs(86400),
            Period::Weekly | Period::OpusWeekly => Duration::from_secs(604800),
            Period::Monthly => Duration::from_secs(2678400), // 31 days
            Period::Lifetime => Duration::ZERO,              // never expires
        }
    }
}

/// Hot-cache key layout.
///
/// Collaborator-facing: other processes sharing the cache address the same
/// entries, so the formats here must stay stable.
pub struct CacheKeys;

impl CacheKeys {
    /// Authentication index: key-index:{secret_hash} -> key id
    pub fn key_index(secret_hash: &str) -> String {
        format!("key-index:{}", secret_hash)
    }

    /// Mirror of the durable key record: key-record:{id}
    ///
    /// Stored as a string-to-string hash; `cache::codec` owns the encoding.
    pub fn key_record(id: Uuid) -> String {
        format!("key-record:{}", id)
    }

    /// Cost bucket: cost:{period}:{id}:{label}
    pub fn cost(period: Period, id: Uuid, label: &str) -> String {
        format!("cost:{}:{}:{}", period.as_str(), id, label)
    }

    /// Sliding rate window: rate-window:{id}
    pub fn rate_window(id: Uuid) -> String {
        format!("rate-window:{}", id)
    }

    /// Bounded usage log: usage-log:{id}
    pub fn usage_log(id: Uuid) -> String {
        format!("usage-log:{}", id)
    }

    /// last_used_at debounce: last-used:{id}
    ///
    /// Presence of this key means a `last_used_at` write was already issued
    /// within the debounce window, so the durable store can be skipped.
    pub fn last_used_debounce(id: Uuid) -> String {
        format!("last-used:{}", id)
    }
}
