//! Wire codec for the `key-record:{id}` cache mirror.
//!
//! The mirror is a string-to-string hash shared with other processes:
//! booleans are `"true"`/`"false"`, lists and structured fields are JSON
//! strings, timestamps are RFC 3339. This module is the only place aware
//! of that representation; everything else works with the typed `Key`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::{CacheError, CacheResult};
use crate::models::{CostLimits, ExpirationPolicy, Key, KeyScope, RateWindowSpec};

/// Encode a key into mirror hash fields. Optional fields are omitted, not
/// written as empty strings.
pub fn encode_key(key: &Key) -> CacheResult<Vec<(String, String)>> {
    let mut fields = vec![
        ("id".to_string(), key.id.to_string()),
        ("key_hash".to_string(), key.key_hash.clone()),
        ("key_prefix".to_string(), key.key_prefix.clone()),
        ("name".to_string(), key.name.clone()),
        ("active".to_string(), encode_bool(key.active)),
        ("scope".to_string(), key.scope.as_str().to_string()),
        ("bindings".to_string(), to_json(&key.bindings)?),
        ("tags".to_string(), to_json(&key.tags)?),
        ("expiration".to_string(), to_json(&key.expiration)?),
        ("created_at".to_string(), key.created_at.to_rfc3339()),
    ];

    if let Some(user_id) = key.user_id {
        fields.push(("user_id".to_string(), user_id.to_string()));
    }
    if let Some(models) = &key.allowed_models {
        fields.push(("allowed_models".to_string(), to_json(models)?));
    }
    if let Some(clients) = &key.allowed_clients {
        fields.push(("allowed_clients".to_string(), to_json(clients)?));
    }
    if let Some(v) = key.limits.daily_microcents {
        fields.push(("limit_daily".to_string(), v.to_string()));
    }
    if let Some(v) = key.limits.weekly_microcents {
        fields.push(("limit_weekly".to_string(), v.to_string()));
    }
    if let Some(v) = key.limits.monthly_microcents {
        fields.push(("limit_monthly".to_string(), v.to_string()));
    }
    if let Some(v) = key.limits.lifetime_microcents {
        fields.push(("limit_lifetime".to_string(), v.to_string()));
    }
    if let Some(v) = key.limits.model_class_weekly_microcents {
        fields.push(("limit_model_class_weekly".to_string(), v.to_string()));
    }
    if let Some(window) = &key.rate_window {
        fields.push(("rate_window".to_string(), to_json(window)?));
    }
    if let Some(at) = key.last_used_at {
        fields.push(("last_used_at".to_string(), at.to_rfc3339()));
    }
    if let Some(at) = key.deleted_at {
        fields.push(("deleted_at".to_string(), at.to_rfc3339()));
    }
    if let Some(by) = &key.deleted_by {
        fields.push(("deleted_by".to_string(), by.clone()));
    }

    Ok(fields)
}

/// Decode mirror hash fields back into a key.
pub fn decode_key(fields: &HashMap<String, String>) -> CacheResult<Key> {
    Ok(Key {
        id: parse_uuid(require(fields, "id")?)?,
        key_hash: require(fields, "key_hash")?.to_string(),
        key_prefix: require(fields, "key_prefix")?.to_string(),
        name: require(fields, "name")?.to_string(),
        user_id: fields
            .get("user_id")
            .map(|s| parse_uuid(s))
            .transpose()?,
        active: decode_bool(require(fields, "active")?)?,
        bindings: fields
            .get("bindings")
            .map(|s| from_json::<BTreeMap<_, _>>(s))
            .transpose()?
            .unwrap_or_default(),
        scope: require(fields, "scope")?
            .parse::<KeyScope>()
            .map_err(CacheError::Deserialization)?,
        allowed_models: fields
            .get("allowed_models")
            .map(|s| from_json::<Vec<String>>(s))
            .transpose()?,
        allowed_clients: fields
            .get("allowed_clients")
            .map(|s| from_json::<Vec<String>>(s))
            .transpose()?,
        tags: fields
            .get("tags")
            .map(|s| from_json::<Vec<String>>(s))
            .transpose()?
            .unwrap_or_default(),
        limits: CostLimits {
            daily_microcents: parse_opt_i64(fields, "limit_daily")?,
            weekly_microcents: parse_opt_i64(fields, "limit_weekly")?,
            monthly_microcents: parse_opt_i64(fields, "limit_monthly")?,
            lifetime_microcents: parse_opt_i64(fields, "limit_lifetime")?,
            model_class_weekly_microcents: parse_opt_i64(fields, "limit_model_class_weekly")?,
        },
        rate_window: fields
            .get("rate_window")
            .map(|s| from_json::<RateWindowSpec>(s))
            .transpose()?,
        expiration: from_json::<ExpirationPolicy>(require(fields, "expiration")?)?,
        created_at: parse_datetime(require(fields, "created_at")?)?,
        last_used_at: fields
            .get("last_used_at")
            .map(|s| parse_datetime(s))
            .transpose()?,
        deleted_at: fields
            .get("deleted_at")
            .map(|s| parse_datetime(s))
            .transpose()?,
        deleted_by: fields.get("deleted_by").cloned(),
    })
}

fn encode_bool(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn decode_bool(value: &str) -> CacheResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(CacheError::Deserialization(format!(
            "invalid boolean '{other}'"
        ))),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> CacheResult<T> {
    serde_json::from_str(value).map_err(|e| CacheError::Deserialization(e.to_string()))
}

fn require<'a>(fields: &'a HashMap<String, String>, name: &str) -> CacheResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| CacheError::Deserialization(format!("missing field '{name}'")))
}

fn parse_uuid(value: &str) -> CacheResult<Uuid> {
    value
        .parse()
        .map_err(|e| CacheError::Deserialization(format!("invalid uuid '{value}': {e}")))
}

fn parse_datetime(value: &str) -> CacheResult<DateTime<Utc>> {
    value
        .parse()
        .map_err(|e| CacheError::Deserialization(format!("invalid timestamp '{value}': {e}")))
}

fn parse_opt_i64(fields: &HashMap<String, String>, name: &str) -> CacheResult<Option<i64>> {
    fields
        .get(name)
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| CacheError::Deserialization(format!("invalid integer '{s}': {e}")))
        })
        .transpose()
}
