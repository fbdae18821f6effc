mod error;
#[cfg(feature = "database-sqlite")]
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use error::{DbError, DbResult};
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqliteKeyStore;
use uuid::Uuid;

use crate::models::{Key, KeyUpdate};

/// Durable, authoritative store for key configuration.
///
/// Authentication does not normally come through here: the hot cache's
/// hash index resolves secrets first and `get_by_hash` is the cold-path
/// fallback (first validation after process start or cache eviction).
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Persist a fully-built key record.
    async fn create(&self, key: &Key) -> DbResult<()>;

    /// Fetch a key by id, including soft-deleted records.
    async fn get(&self, id: Uuid) -> DbResult<Option<Key>>;

    /// Cold-path fallback lookup by secret hash.
    async fn get_by_hash(&self, key_hash: &str) -> DbResult<Option<Key>>;

    /// Partial field-level merge. Numeric ceilings are validated
    /// non-negative before persisting. Returns the updated record.
    async fn update(&self, id: Uuid, update: &KeyUpdate) -> DbResult<Key>;

    /// Flag a key deleted, retaining the record. `deleted_at` and
    /// `deleted_by` are set together.
    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> DbResult<()>;

    /// Clear the soft-delete flag; both delete-metadata fields are cleared
    /// together.
    async fn restore(&self, id: Uuid) -> DbResult<()>;

    /// Physically remove the record.
    async fn hard_delete(&self, id: Uuid) -> DbResult<()>;

    /// One-shot activation of a dormant on-first-use key.
    ///
    /// A single conditional write; returns true only for the caller whose
    /// call performed the transition. Losers must re-read the activated
    /// record rather than compute their own expiry.
    async fn activate_if_dormant(
        &self,
        id: Uuid,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Best-effort last_used_at bump.
    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> DbResult<()>;
}
