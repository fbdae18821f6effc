use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use validator::Validate;

use super::{
    KeyStore,
    error::{DbError, DbResult},
};
use crate::models::{CostLimits, ExpirationPolicy, Key, KeyUpdate, RateWindowSpec};

/// SQLite-backed key store.
///
/// Booleans are native integer booleans; list and struct fields ride as
/// JSON text columns. The string-encoded cache mirror is a cache concern
/// and never leaks in here.
pub struct SqliteKeyStore {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS relay_keys (
    id TEXT PRIMARY KEY,
    key_hash TEXT NOT NULL UNIQUE,
    key_prefix TEXT NOT NULL,
    name TEXT NOT NULL,
    user_id TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    bindings TEXT NOT NULL DEFAULT '{}',
    scope TEXT NOT NULL,
    allowed_models TEXT,
    allowed_clients TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    limit_daily INTEGER,
    limit_weekly INTEGER,
    limit_monthly INTEGER,
    limit_lifetime INTEGER,
    limit_model_class_weekly INTEGER,
    rate_window TEXT,
    expiration_kind TEXT NOT NULL,
    expiry_period INTEGER,
    expiry_unit TEXT,
    activated INTEGER NOT NULL DEFAULT 0,
    activated_at TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    deleted_at TEXT,
    deleted_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_relay_keys_hash ON relay_keys(key_hash);
"#;

impl SqliteKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Install the schema. Idempotent.
    pub async fn migrate(&self) -> DbResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn parse_key(row: &sqlx::sqlite::SqliteRow) -> DbResult<Key> {
        let expiration = match row.get::<&str, _>("expiration_kind") {
            "fixed" => ExpirationPolicy::Fixed {
                expires_at: row.get("expires_at"),
            },
            "on_first_use" => ExpirationPolicy::OnFirstUse {
                period: row.get("expiry_period"),
                unit: row
                    .get::<&str, _>("expiry_unit")
                    .parse()
                    .map_err(DbError::Internal)?,
                activated: row.get::<i64, _>("activated") != 0,
                activated_at: row.get("activated_at"),
                expires_at: row.get("expires_at"),
            },
            other => {
                return Err(DbError::Internal(format!(
                    "Invalid expiration kind: {other}"
                )));
            }
        };

        let allowed_models: Option<String> = row.get("allowed_models");
        let allowed_clients: Option<String> = row.get("allowed_clients");
        let rate_window: Option<String> = row.get("rate_window");

        Ok(Key {
            id: Uuid::parse_str(row.get("id")).map_err(|e| DbError::Internal(e.to_string()))?,
            key_hash: row.get("key_hash"),
            key_prefix: row.get("key_prefix"),
            name: row.get("name"),
            user_id: row
                .get::<Option<String>, _>("user_id")
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| DbError::Internal(e.to_string()))?,
            active: row.get::<i64, _>("active") != 0,
            bindings: serde_json::from_str(row.get("bindings"))?,
            scope: row
                .get::<&str, _>("scope")
                .parse()
                .map_err(DbError::Internal)?,
            allowed_models: allowed_models.map(|s| serde_json::from_str(&s)).transpose()?,
            allowed_clients: allowed_clients
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            tags: serde_json::from_str(row.get("tags"))?,
            limits: CostLimits {
                daily_microcents: row.get("limit_daily"),
                weekly_microcents: row.get("limit_weekly"),
                monthly_microcents: row.get("limit_monthly"),
                lifetime_microcents: row.get("limit_lifetime"),
                model_class_weekly_microcents: row.get("limit_model_class_weekly"),
            },
            rate_window: rate_window
                .map(|s| serde_json::from_str::<RateWindowSpec>(&s))
                .transpose()?,
            expiration,
            created_at: row.get("created_at"),
            last_used_at: row.get("last_used_at"),
            deleted_at: row.get("deleted_at"),
            deleted_by: row.get("deleted_by"),
        })
    }

    fn expiration_parts(
        expiration: &ExpirationPolicy,
    ) -> (
        &'static str,
        Option<i64>,
        Option<&'static str>,
        bool,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
    ) {
        match expiration {
            ExpirationPolicy::Fixed { expires_at } => ("fixed", None, None, false, None, *expires_at),
            ExpirationPolicy::OnFirstUse {
                period,
                unit,
                activated,
                activated_at,
                expires_at,
            } => (
                "on_first_use",
                Some(*period),
                Some(unit.as_str()),
                *activated,
                *activated_at,
                *expires_at,
            ),
        }
    }

    async fn fetch_one(&self, id: Uuid) -> DbResult<Key> {
        self.get(id).await?.ok_or(DbError::NotFound)
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn create(&self, key: &Key) -> DbResult<()> {
        let (kind, period, unit, activated, activated_at, expires_at) =
            Self::expiration_parts(&key.expiration);

        sqlx::query(
            r#"
            INSERT INTO relay_keys (
                id, key_hash, key_prefix, name, user_id, active, bindings, scope,
                allowed_models, allowed_clients, tags,
                limit_daily, limit_weekly, limit_monthly, limit_lifetime,
                limit_model_class_weekly, rate_window,
                expiration_kind, expiry_period, expiry_unit, activated, activated_at,
                expires_at, created_at, last_used_at, deleted_at, deleted_by
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.id.to_string())
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(key.user_id.map(|u| u.to_string()))
        .bind(key.active)
        .bind(serde_json::to_string(&key.bindings)?)
        .bind(key.scope.as_str())
        .bind(
            key.allowed_models
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            key.allowed_clients
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&key.tags)?)
        .bind(key.limits.daily_microcents)
        .bind(key.limits.weekly_microcents)
        .bind(key.limits.monthly_microcents)
        .bind(key.limits.lifetime_microcents)
        .bind(key.limits.model_class_weekly_microcents)
        .bind(
            key.rate_window
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(kind)
        .bind(period)
        .bind(unit)
        .bind(activated)
        .bind(activated_at)
        .bind(expires_at)
        .bind(key.created_at)
        .bind(key.last_used_at)
        .bind(key.deleted_at)
        .bind(&key.deleted_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<Key>> {
        let row = sqlx::query("SELECT * FROM relay_keys WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_key).transpose()
    }

    async fn get_by_hash(&self, key_hash: &str) -> DbResult<Option<Key>> {
        let row = sqlx::query("SELECT * FROM relay_keys WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_key).transpose()
    }

    async fn update(&self, id: Uuid, update: &KeyUpdate) -> DbResult<Key> {
        update
            .validate()
            .map_err(|e| DbError::Validation(e.to_string()))?;

        // Admin edits are last-writer-wins; a merged full-row write is fine
        let mut key = self.fetch_one(id).await?;

        if let Some(name) = &update.name {
            key.name = name.clone();
        }
        if let Some(active) = update.active {
            key.active = active;
        }
        if let Some(bindings) = &update.bindings {
            key.bindings = bindings.clone();
        }
        if let Some(scope) = update.scope {
            key.scope = scope;
        }
        if let Some(models) = &update.allowed_models {
            key.allowed_models = Some(models.clone());
        }
        if let Some(clients) = &update.allowed_clients {
            key.allowed_clients = Some(clients.clone());
        }
        if let Some(tags) = &update.tags {
            key.tags = tags.clone();
        }
        if let Some(v) = update.daily_microcents {
            key.limits.daily_microcents = Some(v);
        }
        if let Some(v) = update.weekly_microcents {
            key.limits.weekly_microcents = Some(v);
        }
        if let Some(v) = update.monthly_microcents {
            key.limits.monthly_microcents = Some(v);
        }
        if let Some(v) = update.lifetime_microcents {
            key.limits.lifetime_microcents = Some(v);
        }
        if let Some(v) = update.model_class_weekly_microcents {
            key.limits.model_class_weekly_microcents = Some(v);
        }
        if let Some(window) = update.rate_window {
            key.rate_window = Some(window);
        }

        sqlx::query(
            r#"
            UPDATE relay_keys SET
                name = ?, active = ?, bindings = ?, scope = ?,
                allowed_models = ?, allowed_clients = ?, tags = ?,
                limit_daily = ?, limit_weekly = ?, limit_monthly = ?,
                limit_lifetime = ?, limit_model_class_weekly = ?, rate_window = ?
            WHERE id = ?
            "#,
        )
        .bind(&key.name)
        .bind(key.active)
        .bind(serde_json::to_string(&key.bindings)?)
        .bind(key.scope.as_str())
        .bind(
            key.allowed_models
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            key.allowed_clients
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&key.tags)?)
        .bind(key.limits.daily_microcents)
        .bind(key.limits.weekly_microcents)
        .bind(key.limits.monthly_microcents)
        .bind(key.limits.lifetime_microcents)
        .bind(key.limits.model_class_weekly_microcents)
        .bind(
            key.rate_window
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(key)
    }

    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE relay_keys SET deleted_at = ?, deleted_by = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(deleted_by)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn restore(&self, id: Uuid) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE relay_keys SET deleted_at = NULL, deleted_by = NULL WHERE id = ? AND deleted_at IS NOT NULL",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM relay_keys WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn activate_if_dormant(
        &self,
        id: Uuid,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        // The conditional write is the whole race guard: exactly one
        // concurrent caller sees rows_affected = 1
        let result = sqlx::query(
            r#"
            UPDATE relay_keys SET activated = 1, activated_at = ?, expires_at = ?
            WHERE id = ? AND expiration_kind = 'on_first_use' AND activated = 0
            "#,
        )
        .bind(activated_at)
        .bind(expires_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_last_used(&self, id: Uuid, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE relay_keys SET last_used_at = ? WHERE id = ?")
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
