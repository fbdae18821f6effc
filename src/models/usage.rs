use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountKind;
use crate::pricing::CostBreakdown;

/// Token counts for a single relayed request.
///
/// Cache-creation and cache-read tokens are billed at different rates from
/// plain input tokens, so they are carried separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_create_tokens: i64,
    #[serde(default)]
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_create_tokens + self.cache_read_tokens
    }
}

/// Usage log entry for a single relayed request.
///
/// Lives only in the bounded `usage-log:{key_id}` cache list and in billing
/// events. Observability only; quota math never reads these.
///
/// Costs are stored in microcents (1/1,000,000 of a dollar) for precision.
/// For example, $0.000207 = 207 microcents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    /// Raw account reference as the relay reported it (may carry a
    /// kind-specific prefix; the resolver strips it)
    pub account_id: Option<String>,
    pub account_kind: Option<AccountKind>,
    pub tokens: TokenUsage,
    pub cost: CostBreakdown,
}
