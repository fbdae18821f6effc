//! The metering engine.
//!
//! Wires the durable key store, the hot counter cache, the pricing lookup,
//! the owner gate, and the account registries into one component that
//! validates keys, reports quota state, and records usage. All
//! collaborators are injected at construction; the engine holds no global
//! state.
//!
//! Consistency between the two stores is eventual by design. The durable
//! store is authoritative for configuration, the cache for hot-path reads.
//! Every durable write here is followed by a mirror refresh, durable first
//! and cache second, so the authentication index and the activation flag
//! never diverge.

mod quota;
mod recorder;
mod resolver;
mod validation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

pub use quota::{CostSnapshot, RateWindowState};
pub use resolver::{AccountRegistry, AccountResolver, RegistryError};
pub use validation::{KeySnapshot, ValidationOutcome};

use crate::cache::{Cache, CacheError, CacheKeys, Period, decode_key, encode_key};
use crate::config::{ConfigError, EngineConfig};
use crate::db::{DbError, KeyStore};
use crate::events::EventBus;
use crate::models::{CreateKey, CreatedKey, Key, KeyUpdate, key_gen, validate_model_patterns};
use crate::pricing::{PricingLookup, PricingTable};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Durable store error: {0}")]
    Db(#[from] DbError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// External check on the key's owning user.
///
/// Called under a bounded timeout during validation. A gate failure or
/// timeout fails open so a sick owner directory cannot take down the
/// relay.
#[async_trait]
pub trait OwnerGate: Send + Sync {
    async fn is_owner_active(&self, user_id: Uuid) -> Result<bool, RegistryError>;
}

/// Gate that accepts every owner. For deployments without a user directory.
pub struct AllowAllOwners;

#[async_trait]
impl OwnerGate for AllowAllOwners {
    async fn is_owner_active(&self, _user_id: Uuid) -> Result<bool, RegistryError> {
        Ok(true)
    }
}

/// Key validation and quota-metering engine.
pub struct MeteringEngine {
    store: Arc<dyn KeyStore>,
    cache: Arc<dyn Cache>,
    pricing: Arc<dyn PricingLookup>,
    /// Secondary calculator when the pricing collaborator fails or stalls
    fallback_pricing: PricingTable,
    owner_gate: Arc<dyn OwnerGate>,
    resolver: AccountResolver,
    events: EventBus,
    config: EngineConfig,
}

impl MeteringEngine {
    /// Build an engine from its collaborators.
    ///
    /// The configuration is validated once here; the engine assumes it is
    /// well-formed everywhere else.
    pub fn new(
        store: Arc<dyn KeyStore>,
        cache: Arc<dyn Cache>,
        pricing: Arc<dyn PricingLookup>,
        owner_gate: Arc<dyn OwnerGate>,
        registries: HashMap<crate::models::AccountKind, Arc<dyn AccountRegistry>>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let resolver = AccountResolver::new(registries, config.collaborator_timeout());
        Ok(Self {
            store,
            cache,
            pricing,
            fallback_pricing: PricingTable::builtin(),
            owner_gate,
            resolver,
            events: EventBus::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The billing event bus. Subscribe here for usage and activation
    /// events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resolver(&self) -> &AccountResolver {
        &self.resolver
    }

    /// Create a key: generate the secret, persist the record, then warm the
    /// cache mirror and hash index.
    ///
    /// The raw secret appears only in the returned value; the store and the
    /// cache only ever see its hash.
    pub async fn create_key(&self, input: CreateKey) -> EngineResult<CreatedKey> {
        use validator::Validate;

        input
            .validate()
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if let Some(patterns) = &input.allowed_models {
            validate_model_patterns(patterns).map_err(|invalid| {
                EngineError::Validation(format!("Invalid model patterns: {}", invalid.join(", ")))
            })?;
        }

        let (secret, key_hash) = key_gen::generate_key_with_prefix(&self.config.key_prefix);
        let key_prefix = secret
            .chars()
            .take(self.config.key_prefix.len() + 4)
            .collect();

        let key = Key {
            id: Uuid::new_v4(),
            key_hash,
            key_prefix,
            name: input.name,
            user_id: input.user_id,
            active: true,
            bindings: input.bindings,
            scope: input.scope,
            allowed_models: input.allowed_models,
            allowed_clients: input.allowed_clients,
            tags: input.tags,
            limits: input.limits,
            rate_window: input.rate_window,
            expiration: input.expiration,
            created_at: Utc::now(),
            last_used_at: None,
            deleted_at: None,
            deleted_by: None,
        };

        self.store.create(&key).await?;
        self.refresh_mirror(&key).await?;

        Ok(CreatedKey { key, secret })
    }

    /// Fetch a key's durable record, including soft-deleted keys.
    pub async fn get_key(&self, id: Uuid) -> EngineResult<Option<Key>> {
        Ok(self.store.get(id).await?)
    }

    /// Partial field-level update, durable first, then mirror refresh.
    pub async fn update_key(&self, id: Uuid, update: &KeyUpdate) -> EngineResult<Key> {
        if let Some(patterns) = &update.allowed_models {
            validate_model_patterns(patterns).map_err(|invalid| {
                EngineError::Validation(format!("Invalid model patterns: {}", invalid.join(", ")))
            })?;
        }

        let key = self.store.update(id, update).await?;
        self.refresh_mirror(&key).await?;
        Ok(key)
    }

    /// Flag a key deleted, keeping the record and its counters.
    pub async fn soft_delete_key(&self, id: Uuid, deleted_by: &str) -> EngineResult<()> {
        self.store.soft_delete(id, deleted_by).await?;
        self.refresh_mirror_from_store(id).await
    }

    /// Clear a soft delete.
    pub async fn restore_key(&self, id: Uuid) -> EngineResult<()> {
        self.store.restore(id).await?;
        self.refresh_mirror_from_store(id).await
    }

    /// Physically purge a key and proactively drop its cache entries:
    /// the hash index, the mirror, the current-label cost buckets, the
    /// rate window, and the usage log.
    ///
    /// Cost buckets under older labels are left to age out via TTL.
    pub async fn hard_delete_key(&self, id: Uuid) -> EngineResult<()> {
        let key = self.store.get(id).await?.ok_or(DbError::NotFound)?;
        self.store.hard_delete(id).await?;

        self.cache
            .delete(&CacheKeys::key_index(&key.key_hash))
            .await?;
        self.cache.delete(&CacheKeys::key_record(id)).await?;
        self.cache.delete(&CacheKeys::rate_window(id)).await?;
        self.cache.delete(&CacheKeys::usage_log(id)).await?;
        self.cache
            .delete(&CacheKeys::last_used_debounce(id))
            .await?;

        let now = Utc::now();
        for period in [
            Period::Daily,
            Period::Weekly,
            Period::Monthly,
            Period::Lifetime,
            Period::OpusWeekly,
        ] {
            let label = period.label(now, self.config.utc_offset_hours);
            self.cache
                .delete(&CacheKeys::cost(period, id, &label))
                .await?;
        }

        Ok(())
    }

    /// Read a key through the cache mirror, falling back to the durable
    /// store (and re-warming the mirror) on a miss.
    pub(crate) async fn load_key(&self, id: Uuid) -> EngineResult<Option<Key>> {
        let fields = self.cache.hash_get_all(&CacheKeys::key_record(id)).await?;
        if !fields.is_empty() {
            match decode_key(&fields) {
                Ok(key) => return Ok(Some(key)),
                Err(err) => {
                    tracing::warn!(key_id = %id, error = %err, "Discarding undecodable key mirror")
                }
            }
        }

        match self.store.get(id).await? {
            Some(key) => {
                if let Err(err) = self.refresh_mirror(&key).await {
                    tracing::warn!(key_id = %id, error = %err, "Failed to re-warm key mirror");
                }
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Rewrite the cache mirror and hash index from a durable record.
    ///
    /// The index carries no TTL; eviction is recovered by the durable
    /// fallback in validation.
    pub(crate) async fn refresh_mirror(&self, key: &Key) -> EngineResult<()> {
        let fields = encode_key(key)?;
        self.cache
            .hash_set_all(
                &CacheKeys::key_record(key.id),
                &fields,
                self.config.mirror_ttl(),
            )
            .await?;
        self.cache
            .set_bytes(
                &CacheKeys::key_index(&key.key_hash),
                key.id.to_string().as_bytes(),
                Duration::ZERO,
            )
            .await?;
        Ok(())
    }

    async fn refresh_mirror_from_store(&self, id: Uuid) -> EngineResult<()> {
        let key = self.store.get(id).await?.ok_or(DbError::NotFound)?;
        self.refresh_mirror(&key).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub(crate) fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub(crate) fn pricing(&self) -> &Arc<dyn PricingLookup> {
        &self.pricing
    }

    pub(crate) fn fallback_pricing(&self) -> &PricingTable {
        &self.fallback_pricing
    }

    pub(crate) fn owner_gate(&self) -> &Arc<dyn OwnerGate> {
        &self.owner_gate
    }
}
