//! Key validation.
//!
//! `validate` is the hot-path entry point called on every inbound request.
//! Expected authentication outcomes are data, not errors: the discriminated
//! [`ValidationOutcome`] covers everything from a malformed secret to a
//! disabled owner, and only an unreachable store surfaces as `Err` so
//! callers can tell "unauthenticated" apart from "system down".
//!
//! The engine never rejects over-quota requests itself. A `Valid` outcome
//! carries the current cost and rate-window state; the relay in front makes
//! the admission decision.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::{EngineResult, MeteringEngine};
use crate::cache::CacheKeys;
use crate::events::BillingEvent;
use crate::models::{Key, key_gen};

use super::quota::{CostSnapshot, RateWindowState};

/// Read-only view of a validated key handed to the relay.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    #[serde(flatten)]
    pub key: Key,
    pub costs: CostSnapshot,
    pub rate_window: Option<RateWindowState>,
}

/// Result of a validation call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// The secret does not carry the configured prefix.
    Malformed,
    /// No key matches the secret's hash.
    NotFound,
    /// The key is soft-deleted.
    Deleted,
    /// The key is administratively disabled.
    Disabled,
    /// The key's expiry instant has passed.
    Expired,
    /// The key's owning user is disabled.
    OwnerDisabled,
    Valid(Box<KeySnapshot>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid(_))
    }
}

impl MeteringEngine {
    /// Validate a raw secret for relay traffic.
    ///
    /// The first successful validation of a dormant on-first-use key
    /// activates it and starts its countdown.
    pub async fn validate(&self, secret: &str) -> EngineResult<ValidationOutcome> {
        self.validate_inner(secret, true).await
    }

    /// Validate a raw secret without side effects.
    ///
    /// Identical to [`validate`](Self::validate) except that it never
    /// triggers the activation transition, so dashboards can inspect a
    /// dormant key without starting its countdown.
    pub async fn validate_for_stats(&self, secret: &str) -> EngineResult<ValidationOutcome> {
        self.validate_inner(secret, false).await
    }

    async fn validate_inner(
        &self,
        secret: &str,
        allow_activation: bool,
    ) -> EngineResult<ValidationOutcome> {
        if !key_gen::has_valid_prefix(secret, &self.config().key_prefix) {
            return Ok(ValidationOutcome::Malformed);
        }

        let hash = key_gen::hash_key(secret);
        let mut key = match self.lookup_by_hash(&hash).await? {
            Some(key) => key,
            None => return Ok(ValidationOutcome::NotFound),
        };

        if key.is_deleted() {
            return Ok(ValidationOutcome::Deleted);
        }
        if !key.active {
            return Ok(ValidationOutcome::Disabled);
        }

        if allow_activation && key.expiration.is_dormant() {
            key = self.activate(&key).await?;
        }

        let now = Utc::now();
        if let Some(expires_at) = key.expiration.effective_expires_at() {
            if now > expires_at {
                return Ok(ValidationOutcome::Expired);
            }
        }

        if let Some(user_id) = key.user_id {
            if !self.owner_allows(user_id).await {
                return Ok(ValidationOutcome::OwnerDisabled);
            }
        }

        let costs = self.cost_snapshot(key.id).await?;
        let rate_window = self.rate_window_for(&key, now).await?;

        Ok(ValidationOutcome::Valid(Box::new(KeySnapshot {
            key,
            costs,
            rate_window,
        })))
    }

    /// Resolve a secret hash to a key via the cache index, falling back to
    /// the durable store and backfilling the index on a miss.
    async fn lookup_by_hash(&self, hash: &str) -> EngineResult<Option<Key>> {
        let index_key = CacheKeys::key_index(hash);
        if let Some(bytes) = self.cache().get_bytes(&index_key).await? {
            if let Some(id) = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                if let Some(key) = self.load_key(id).await? {
                    return Ok(Some(key));
                }
            }
            // Index pointed at a record that no longer exists
            self.cache().delete(&index_key).await?;
        }

        match self.store().get_by_hash(hash).await? {
            Some(key) => {
                if let Err(err) = self.refresh_mirror(&key).await {
                    tracing::warn!(key_id = %key.id, error = %err, "Failed to backfill key index");
                }
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Fire the one-time dormant-to-active transition.
    ///
    /// A single conditional durable write decides the winner among
    /// concurrent first validations; everyone re-reads the activated record
    /// so all callers observe the same expiry. The winner refreshes the
    /// mirror, durable first, cache second.
    async fn activate(&self, key: &Key) -> EngineResult<Key> {
        use crate::models::ExpirationPolicy;

        let (period, unit) = match &key.expiration {
            ExpirationPolicy::OnFirstUse { period, unit, .. } => (*period, *unit),
            ExpirationPolicy::Fixed { .. } => return Ok(key.clone()),
        };

        let now = Utc::now();
        let expires_at = unit.add_to(now, period);
        let won = self
            .store()
            .activate_if_dormant(key.id, now, expires_at)
            .await?;

        let activated = self
            .store()
            .get(key.id)
            .await?
            .ok_or(crate::db::DbError::NotFound)?;

        if won {
            self.refresh_mirror(&activated).await?;
            if let Some(shared_expiry) = activated.expiration.effective_expires_at() {
                self.events().publish(BillingEvent::KeyActivated {
                    key_id: activated.id,
                    activated_at: now,
                    expires_at: shared_expiry,
                });
            }
            tracing::info!(key_id = %activated.id, expires_at = %expires_at, "Activated key on first use");
        }

        Ok(activated)
    }

    /// Check the owner gate under a bounded timeout, failing open.
    async fn owner_allows(&self, user_id: Uuid) -> bool {
        let check = self.owner_gate().is_owner_active(user_id);
        match tokio::time::timeout(self.config().collaborator_timeout(), check).await {
            Ok(Ok(active)) => active,
            Ok(Err(err)) => {
                tracing::warn!(%user_id, error = %err, "Owner gate failed, allowing request");
                true
            }
            Err(_) => {
                tracing::warn!(%user_id, "Owner gate timed out, allowing request");
                true
            }
        }
    }
}
