//! Engine configuration.
//!
//! One typed struct enumerates every recognized option with its default;
//! it is validated once at construction and then passed by reference. No
//! options bags, no scattered ad-hoc defaults.

mod cache;

use std::time::Duration;

pub use cache::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AccountKind, DEFAULT_KEY_PREFIX};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Top-level configuration for the metering engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Prefix every valid key secret must carry (format check).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// UTC offset (whole hours) applied before deriving period labels, so
    /// buckets roll at the deployment's local midnight.
    #[serde(default)]
    pub utc_offset_hours: i32,

    /// Maximum entries retained per key in the usage log.
    #[serde(default = "default_usage_log_max_entries")]
    pub usage_log_max_entries: usize,

    /// TTL for the usage log list in seconds.
    #[serde(default = "default_usage_log_ttl_secs")]
    pub usage_log_ttl_secs: u64,

    /// TTL for the key-record cache mirror in seconds.
    #[serde(default = "default_mirror_ttl_secs")]
    pub mirror_ttl_secs: u64,

    /// Debounce interval for durable last_used_at writes in seconds.
    #[serde(default = "default_last_used_debounce_secs")]
    pub last_used_debounce_secs: u64,

    /// Bounded timeout for external collaborator calls (pricing lookup,
    /// owner gate, account registries) in milliseconds.
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,

    /// Hot counter cache backend.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Model class gating the class-specific weekly bucket.
    #[serde(default)]
    pub model_class: ModelClassConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            utc_offset_hours: 0,
            usage_log_max_entries: default_usage_log_max_entries(),
            usage_log_ttl_secs: default_usage_log_ttl_secs(),
            mirror_ttl_secs: default_mirror_ttl_secs(),
            last_used_debounce_secs: default_last_used_debounce_secs(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            cache: CacheConfig::default(),
            model_class: ModelClassConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "key_prefix cannot be empty".into(),
            ));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigError::Validation(format!(
                "utc_offset_hours must be between -12 and 14, got {}",
                self.utc_offset_hours
            )));
        }
        if self.usage_log_max_entries == 0 {
            return Err(ConfigError::Validation(
                "usage_log_max_entries must be greater than 0".into(),
            ));
        }
        if self.collaborator_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "collaborator_timeout_ms must be greater than 0".into(),
            ));
        }
        self.model_class.validate()?;
        self.cache.validate()
    }

    pub fn mirror_ttl(&self) -> Duration {
        Duration::from_secs(self.mirror_ttl_secs)
    }

    pub fn usage_log_ttl(&self) -> Duration {
        Duration::from_secs(self.usage_log_ttl_secs)
    }

    pub fn last_used_debounce(&self) -> Duration {
        Duration::from_secs(self.last_used_debounce_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

/// The model class whose traffic additionally accumulates into the
/// class-specific weekly bucket.
///
/// A request counts only when the model name carries the marker AND the
/// serving account's kind is in the allow-set; anything else skips the
/// bucket entirely rather than adding zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelClassConfig {
    /// Case-insensitive substring identifying the class in model names.
    #[serde(default = "default_class_marker")]
    pub marker: String,

    /// Account kinds whose usage counts toward the class bucket.
    #[serde(default = "default_class_account_kinds")]
    pub account_kinds: Vec<AccountKind>,
}

impl Default for ModelClassConfig {
    fn default() -> Self {
        Self {
            marker: default_class_marker(),
            account_kinds: default_class_account_kinds(),
        }
    }
}

impl ModelClassConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.marker.is_empty() {
            return Err(ConfigError::Validation(
                "model_class.marker cannot be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn matches_model(&self, model: &str) -> bool {
        model
            .to_ascii_lowercase()
            .contains(&self.marker.to_ascii_lowercase())
    }

    pub fn allows_kind(&self, kind: AccountKind) -> bool {
        self.account_kinds.contains(&kind)
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_class_marker() -> String {
    "opus".to_string()
}

fn default_class_account_kinds() -> Vec<AccountKind> {
    vec![AccountKind::Claude, AccountKind::ClaudeConsole]
}

fn default_usage_log_max_entries() -> usize {
    100
}

fn default_usage_log_ttl_secs() -> u64 {
    604800 // 7 days
}

fn default_mirror_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_last_used_debounce_secs() -> u64 {
    60
}

fn default_collaborator_timeout_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_prefix, "tg_live_");
        assert_eq!(config.utc_offset_hours, 0);
    }

    #[test]
    fn test_rejects_bad_offset() {
        let config = EngineConfig {
            utc_offset_hours: 15,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let config = EngineConfig {
            key_prefix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_class_matching() {
        let class = ModelClassConfig::default();
        assert!(class.matches_model("claude-opus-4"));
        assert!(class.matches_model("CLAUDE-OPUS-4-1"));
        assert!(!class.matches_model("claude-sonnet-4"));

        assert!(class.allows_kind(AccountKind::Claude));
        assert!(!class.allows_kind(AccountKind::Gemini));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"utc_offset_hours": 8}"#).unwrap();
        assert_eq!(config.utc_offset_hours, 8);
        assert_eq!(config.usage_log_max_entries, 100);
        assert!(matches!(config.cache, CacheConfig::Memory(_)));
    }
}
