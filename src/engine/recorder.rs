//! Usage recording.
//!
//! `record` runs after the relay has already answered the caller, so it
//! never propagates an error: pricing falls back to the built-in table and
//! then to zero cost, counter and log writes are logged on failure, and the
//! billing event is fire and forget. Metering a request must never fail
//! that request.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::MeteringEngine;
use crate::cache::{CacheKeys, Period};
use crate::events::BillingEvent;
use crate::models::{AccountKind, TokenUsage, UsageRecord};
use crate::pricing::CostBreakdown;

impl MeteringEngine {
    /// Record a completed request against a key.
    ///
    /// Increments the daily, weekly, monthly, and lifetime cost buckets,
    /// the model-class weekly bucket when the request qualifies, and the
    /// rate window if the key has one configured, then appends a usage-log
    /// entry, bumps the durable `last_used_at` under a debounce, and
    /// publishes a billing event.
    pub async fn record(
        &self,
        key_id: Uuid,
        usage: TokenUsage,
        model: &str,
        account_id: Option<String>,
        account_kind: Option<AccountKind>,
    ) {
        let now = Utc::now();
        let cost = self.compute_cost(&usage, model).await;

        for period in [
            Period::Daily,
            Period::Weekly,
            Period::Monthly,
            Period::Lifetime,
        ] {
            self.add_to_bucket(period, key_id, now, cost.total_microcents)
                .await;
        }

        // The class bucket counts only matching models served from an
        // allowed account kind; everything else skips it entirely.
        let class = &self.config().model_class;
        if class.matches_model(model) && account_kind.is_some_and(|kind| class.allows_kind(kind)) {
            self.add_to_bucket(Period::OpusWeekly, key_id, now, cost.total_microcents)
                .await;
        }

        self.add_to_rate_window(key_id, &usage, &cost, now).await;

        let record = UsageRecord {
            timestamp: now,
            model: model.to_string(),
            account_id: account_id.clone(),
            account_kind,
            tokens: usage,
            cost,
        };
        self.append_usage_log(key_id, &record).await;

        self.touch_last_used(key_id, now).await;

        self.events().publish(BillingEvent::UsageRecorded {
            key_id,
            timestamp: now,
            model: model.to_string(),
            account_id,
            account_kind,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_create_tokens: usage.cache_create_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cost,
        });
    }

    /// Price the usage, degrading instead of failing.
    ///
    /// The external lookup runs under a bounded timeout; on failure the
    /// built-in table prices the request, and if the model is unknown there
    /// too the cost is zero while the tokens are still recorded.
    async fn compute_cost(&self, usage: &TokenUsage, model: &str) -> CostBreakdown {
        let lookup = self.pricing().cost(usage, model);
        match tokio::time::timeout(self.config().collaborator_timeout(), lookup).await {
            Ok(Ok(cost)) => return cost,
            Ok(Err(err)) => {
                tracing::warn!(%model, error = %err, "Pricing lookup failed, using built-in table")
            }
            Err(_) => {
                tracing::warn!(%model, "Pricing lookup timed out, using built-in table")
            }
        }

        match self.fallback_pricing().lookup(model) {
            Some(pricing) => pricing.cost(usage),
            None => {
                tracing::warn!(%model, "No pricing for model, recording zero cost");
                CostBreakdown::zero()
            }
        }
    }

    async fn add_to_bucket(
        &self,
        period: Period,
        key_id: Uuid,
        now: DateTime<Utc>,
        delta_microcents: i64,
    ) {
        let label = period.label(now, self.config().utc_offset_hours);
        let bucket = CacheKeys::cost(period, key_id, &label);
        if let Err(err) = self
            .cache()
            .incr_by(&bucket, delta_microcents, period.bucket_ttl())
            .await
        {
            tracing::error!(%bucket, error = %err, "Failed to increment cost bucket");
        }
    }

    async fn add_to_rate_window(
        &self,
        key_id: Uuid,
        usage: &TokenUsage,
        cost: &CostBreakdown,
        now: DateTime<Utc>,
    ) {
        let spec = match self.load_key(key_id).await {
            Ok(Some(key)) => key.rate_window,
            Ok(None) => None,
            Err(err) => {
                tracing::error!(%key_id, error = %err, "Failed to load key for rate window");
                None
            }
        };
        let Some(spec) = spec else { return };
        let duration = std::time::Duration::from_secs(spec.duration_minutes.max(0) as u64 * 60);

        if let Err(err) = self
            .cache()
            .window_add(
                &CacheKeys::rate_window(key_id),
                duration,
                1,
                usage.total(),
                cost.total_microcents,
                now,
            )
            .await
        {
            tracing::error!(%key_id, error = %err, "Failed to update rate window");
        }
    }

    async fn append_usage_log(&self, key_id: Uuid, record: &UsageRecord) {
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(%key_id, error = %err, "Failed to serialize usage record");
                return;
            }
        };
        if let Err(err) = self
            .cache()
            .list_push(
                &CacheKeys::usage_log(key_id),
                &bytes,
                self.config().usage_log_max_entries,
                self.config().usage_log_ttl(),
            )
            .await
        {
            tracing::warn!(%key_id, error = %err, "Failed to append usage log");
        }
    }

    /// Best-effort durable `last_used_at` bump, debounced through the cache
    /// so a busy key does not hammer the durable store.
    async fn touch_last_used(&self, key_id: Uuid, now: DateTime<Utc>) {
        let debounce_key = CacheKeys::last_used_debounce(key_id);
        let due = match self
            .cache()
            .set_nx(&debounce_key, b"1", self.config().last_used_debounce())
            .await
        {
            Ok(due) => due,
            Err(err) => {
                tracing::warn!(%key_id, error = %err, "last_used debounce check failed");
                true
            }
        };
        if !due {
            return;
        }
        if let Err(err) = self.store().update_last_used(key_id, now).await {
            tracing::warn!(%key_id, error = %err, "Failed to update last_used_at");
        }
    }
}
