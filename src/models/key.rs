use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::AccountKind;

/// Permission scope for relay keys.
///
/// A key carries exactly one scope. `Relay` keys can submit completion
/// traffic, `ReadOnly` keys can only inspect their own statistics, and
/// `Admin` keys may additionally manage other keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    Relay,
    ReadOnly,
    Admin,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Relay => "relay",
            KeyScope::ReadOnly => "read_only",
            KeyScope::Admin => "admin",
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for KeyScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relay" => Ok(KeyScope::Relay),
            "read_only" => Ok(KeyScope::ReadOnly),
            "admin" => Ok(KeyScope::Admin),
            _ => Err(format!("Invalid scope '{s}'")),
        }
    }
}

/// Unit for the on-first-use expiration period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryUnit {
    Hours,
    Days,
    Weeks,
    Months,
}

impl ExpiryUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryUnit::Hours => "hours",
            ExpiryUnit::Days => "days",
            ExpiryUnit::Weeks => "weeks",
            ExpiryUnit::Months => "months",
        }
    }

    /// Compute `at + period` in this unit.
    pub fn add_to(&self, at: DateTime<Utc>, period: i64) -> DateTime<Utc> {
        match self {
            ExpiryUnit::Hours => at + chrono::Duration::hours(period),
            ExpiryUnit::Days => at + chrono::Duration::days(period),
            ExpiryUnit::Weeks => at + chrono::Duration::weeks(period),
            ExpiryUnit::Months => at + chrono::Months::new(period.max(0) as u32),
        }
    }
}

impl FromStr for ExpiryUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hours" => Ok(ExpiryUnit::Hours),
            "days" => Ok(ExpiryUnit::Days),
            "weeks" => Ok(ExpiryUnit::Weeks),
            "months" => Ok(ExpiryUnit::Months),
            _ => Err(format!("Invalid expiry unit '{s}'")),
        }
    }
}

/// When and how a key stops being valid.
///
/// `Fixed` is terminal at creation: the key either never expires or expires
/// at a known instant. `OnFirstUse` starts dormant; the countdown begins on
/// the first successful validation, at which point `expires_at` is computed
/// exactly once from `activated_at + period`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    Fixed {
        expires_at: Option<DateTime<Utc>>,
    },
    OnFirstUse {
        period: i64,
        unit: ExpiryUnit,
        activated: bool,
        activated_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl ExpirationPolicy {
    /// The instant after which the key is expired, if one is known yet.
    ///
    /// A dormant `OnFirstUse` key has no expiry until it is activated.
    pub fn effective_expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ExpirationPolicy::Fixed { expires_at } => *expires_at,
            ExpirationPolicy::OnFirstUse { expires_at, .. } => *expires_at,
        }
    }

    /// Whether this key still needs its one-time activation transition.
    pub fn is_dormant(&self) -> bool {
        matches!(
            self,
            ExpirationPolicy::OnFirstUse {
                activated: false,
                ..
            }
        )
    }
}

/// Cost ceilings carried by a key, in microcents (1/1,000,000 of a dollar).
///
/// All ceilings are independent; `None` means unlimited for that period.
/// `model_class_weekly` is the model-class-specific (e.g. Opus) weekly cap
/// layered on top of the general weekly cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLimits {
    pub daily_microcents: Option<i64>,
    pub weekly_microcents: Option<i64>,
    pub monthly_microcents: Option<i64>,
    pub lifetime_microcents: Option<i64>,
    pub model_class_weekly_microcents: Option<i64>,
}

/// Sliding rate-window specification.
///
/// The window bounds requests, tokens, and cost over a short interval
/// independent of the longer daily/weekly/monthly ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowSpec {
    pub duration_minutes: i64,
    pub max_requests: Option<i64>,
    pub max_tokens: Option<i64>,
    pub max_cost_microcents: Option<i64>,
}

/// A credential token gating access to the relay.
///
/// The durable store owns this record; the hot cache carries a string-encoded
/// mirror of it (see `cache::codec`) for fast hot-path reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub id: Uuid,
    /// SHA-256 hex hash of the raw secret. The raw secret is never stored.
    pub key_hash: String,
    /// Prefix of the key (for identification without exposing the full key)
    pub key_prefix: String,
    pub name: String,
    /// Owning user, checked against the external owner directory on validate
    pub user_id: Option<Uuid>,
    pub active: bool,
    /// One optional bound account per provider family
    pub bindings: BTreeMap<AccountKind, String>,
    pub scope: KeyScope,
    /// Allowed models (None = all models, supports trailing wildcards)
    pub allowed_models: Option<Vec<String>>,
    /// Allowed client identifiers (None = all clients)
    pub allowed_clients: Option<Vec<String>>,
    pub tags: Vec<String>,
    pub limits: CostLimits,
    pub rate_window: Option<RateWindowSpec>,
    pub expiration: ExpirationPolicy,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Soft-delete metadata: set together, cleared together
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Key {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Check if a model is allowed by this key's `allowed_models` restriction.
    ///
    /// `None` or an empty list allows every model. Patterns support a
    /// trailing wildcard: `"claude-opus-*"` matches `"claude-opus-4"`.
    pub fn is_model_allowed(&self, model: &str) -> bool {
        match &self.allowed_models {
            None => true,
            Some(patterns) if patterns.is_empty() => true,
            Some(patterns) => patterns.iter().any(|p| model_matches_pattern(model, p)),
        }
    }

    /// Check if a client identifier is allowed by this key's restriction.
    pub fn is_client_allowed(&self, client: &str) -> bool {
        match &self.allowed_clients {
            None => true,
            Some(clients) if clients.is_empty() => true,
            Some(clients) => clients.iter().any(|c| c == client),
        }
    }
}

/// Check if a model name matches a pattern (exact or trailing wildcard).
fn model_matches_pattern(model: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        model.starts_with(prefix)
    } else {
        model == pattern
    }
}

/// Validate model patterns for key configuration.
///
/// Returns `Err` with the offending patterns: empty strings, a bare `*`
/// (use `None` for all models), and non-trailing wildcards are rejected.
pub fn validate_model_patterns(patterns: &[String]) -> Result<(), Vec<String>> {
    let invalid: Vec<String> = patterns
        .iter()
        .filter(|p| !is_valid_model_pattern(p))
        .cloned()
        .collect();

    if invalid.is_empty() { Ok(()) } else { Err(invalid) }
}

fn is_valid_model_pattern(pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return false;
    }
    if let Some(star_pos) = pattern.find('*') {
        if star_pos != pattern.len() - 1 || star_pos == 0 {
            return false;
        }
    }
    true
}

/// Input for creating a key. The secret itself is generated separately
/// (see `models::key_gen`) and only its hash reaches the store.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateKey {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub bindings: BTreeMap<AccountKind, String>,
    pub scope: KeyScope,
    pub allowed_models: Option<Vec<String>>,
    pub allowed_clients: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub limits: CostLimits,
    pub rate_window: Option<RateWindowSpec>,
    pub expiration: ExpirationPolicy,
}

/// Partial, field-level update of a key.
///
/// `None` leaves a field untouched. Numeric ceilings are validated
/// non-negative before they reach the store.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct KeyUpdate {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub active: Option<bool>,
    pub bindings: Option<BTreeMap<AccountKind, String>>,
    pub scope: Option<KeyScope>,
    pub allowed_models: Option<Vec<String>>,
    pub allowed_clients: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    #[validate(range(min = 0))]
    pub daily_microcents: Option<i64>,
    #[validate(range(min = 0))]
    pub weekly_microcents: Option<i64>,
    #[validate(range(min = 0))]
    pub monthly_microcents: Option<i64>,
    #[validate(range(min = 0))]
    pub lifetime_microcents: Option<i64>,
    #[validate(range(min = 0))]
    pub model_class_weekly_microcents: Option<i64>,
    pub rate_window: Option<RateWindowSpec>,
}

/// Returned on creation only (contains the raw key)
#[derive(Debug, Clone, Serialize)]
pub struct CreatedKey {
    #[serde(flatten)]
    pub key: Key,
    /// The raw secret (only shown once at creation)
    pub secret: String,
}
