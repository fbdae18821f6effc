use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TokenUsage;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("No pricing for model '{0}'")]
    UnknownModel(String),

    #[error("Pricing lookup timed out")]
    Timeout,

    #[error("Pricing lookup failed: {0}")]
    Lookup(String),
}

/// Cost of a single request, itemized by token class.
///
/// All amounts are microcents (1/1,000,000 of a dollar).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_microcents: i64,
    pub output_microcents: i64,
    #[serde(default)]
    pub cache_create_microcents: i64,
    #[serde(default)]
    pub cache_read_microcents: i64,
    pub total_microcents: i64,
}

impl CostBreakdown {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// External pricing collaborator.
///
/// The recorder calls this under a bounded timeout and falls back to the
/// static [`PricingTable`] when it fails or stalls, so a slow pricing
/// service can never hold up usage recording.
#[async_trait]
pub trait PricingLookup: Send + Sync {
    async fn cost(&self, usage: &TokenUsage, model: &str) -> Result<CostBreakdown, PricingError>;
}

/// Pricing for a single model, per 1M tokens in microcents.
///
/// Per-1M matches provider price sheets and keeps the arithmetic in
/// integers. For example $3/1M input tokens = 3_000_000 microcents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_1m_tokens: i64,

    #[serde(default)]
    pub output_per_1m_tokens: i64,

    /// Cost per 1M cache-write tokens. Falls back to input pricing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_per_1m_tokens: Option<i64>,

    /// Cost per 1M cache-read tokens. Falls back to input pricing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_per_1m_tokens: Option<i64>,
}

impl ModelPricing {
    /// Itemized cost of `usage` at this model's rates.
    pub fn cost(&self, usage: &TokenUsage) -> CostBreakdown {
        let input = per_1m(usage.input_tokens, self.input_per_1m_tokens);
        let output = per_1m(usage.output_tokens, self.output_per_1m_tokens);
        let cache_create = per_1m(
            usage.cache_create_tokens,
            self.cache_write_per_1m_tokens
                .unwrap_or(self.input_per_1m_tokens),
        );
        let cache_read = per_1m(
            usage.cache_read_tokens,
            self.cache_read_per_1m_tokens
                .unwrap_or(self.input_per_1m_tokens),
        );

        CostBreakdown {
            input_microcents: input,
            output_microcents: output,
            cache_create_microcents: cache_create,
            cache_read_microcents: cache_read,
            total_microcents: input + output + cache_create + cache_read,
        }
    }
}

fn per_1m(tokens: i64, rate_per_1m: i64) -> i64 {
    ((tokens as i128 * rate_per_1m as i128) / 1_000_000) as i64
}

/// Static pricing table keyed by model name with trailing-wildcard
/// patterns. The secondary calculator behind the external lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    pub models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new(models: HashMap<String, ModelPricing>) -> Self {
        Self { models }
    }

    /// Built-in defaults covering the common provider families.
    pub fn builtin() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "claude-opus-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 15_000_000,
                output_per_1m_tokens: 75_000_000,
                cache_write_per_1m_tokens: Some(18_750_000),
                cache_read_per_1m_tokens: Some(1_500_000),
            },
        );
        models.insert(
            "claude-sonnet-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 3_000_000,
                output_per_1m_tokens: 15_000_000,
                cache_write_per_1m_tokens: Some(3_750_000),
                cache_read_per_1m_tokens: Some(300_000),
            },
        );
        models.insert(
            "claude-haiku-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 800_000,
                output_per_1m_tokens: 4_000_000,
                cache_write_per_1m_tokens: Some(1_000_000),
                cache_read_per_1m_tokens: Some(80_000),
            },
        );
        models.insert(
            "gemini-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 1_250_000,
                output_per_1m_tokens: 10_000_000,
                ..Default::default()
            },
        );
        models.insert(
            "gpt-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 2_500_000,
                output_per_1m_tokens: 10_000_000,
                ..Default::default()
            },
        );
        Self { models }
    }

    /// Resolve pricing for a model: exact match first, then the longest
    /// matching trailing-wildcard pattern.
    pub fn lookup(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(pricing) = self.models.get(model) {
            return Some(pricing);
        }

        self.models
            .iter()
            .filter_map(|(pattern, pricing)| {
                let prefix = pattern.strip_suffix('*')?;
                model.starts_with(prefix).then_some((prefix.len(), pricing))
            })
            .max_by_key(|(prefix_len, _)| *prefix_len)
            .map(|(_, pricing)| pricing)
    }
}

#[async_trait]
impl PricingLookup for PricingTable {
    async fn cost(&self, usage: &TokenUsage, model: &str) -> Result<CostBreakdown, PricingError> {
        let pricing = self
            .lookup(model)
            .ok_or_else(|| PricingError::UnknownModel(model.to_string()))?;
        Ok(pricing.cost(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_is_exact_integer_math() {
        let pricing = ModelPricing {
            input_per_1m_tokens: 3_000_000,
            output_per_1m_tokens: 15_000_000,
            ..Default::default()
        };
        let usage = TokenUsage {
            input_tokens: 1_000,
            output_tokens: 500,
            ..Default::default()
        };

        let cost = pricing.cost(&usage);
        // 1000 tokens at $3/1M = $0.003 = 3000 microcents
        assert_eq!(cost.input_microcents, 3_000);
        // 500 tokens at $15/1M = $0.0075 = 7500 microcents
        assert_eq!(cost.output_microcents, 7_500);
        assert_eq!(cost.total_microcents, 10_500);
    }

    #[test]
    fn test_cache_rates_fall_back_to_input_rate() {
        let pricing = ModelPricing {
            input_per_1m_tokens: 2_000_000,
            output_per_1m_tokens: 8_000_000,
            ..Default::default()
        };
        let usage = TokenUsage {
            cache_create_tokens: 1_000_000,
            cache_read_tokens: 500_000,
            ..Default::default()
        };

        let cost = pricing.cost(&usage);
        assert_eq!(cost.cache_create_microcents, 2_000_000);
        assert_eq!(cost.cache_read_microcents, 1_000_000);
    }

    #[test]
    fn test_lookup_prefers_exact_then_longest_prefix() {
        let mut models = HashMap::new();
        models.insert(
            "claude-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 1,
                ..Default::default()
            },
        );
        models.insert(
            "claude-opus-*".to_string(),
            ModelPricing {
                input_per_1m_tokens: 2,
                ..Default::default()
            },
        );
        models.insert(
            "claude-opus-4".to_string(),
            ModelPricing {
                input_per_1m_tokens: 3,
                ..Default::default()
            },
        );
        let table = PricingTable::new(models);

        assert_eq!(table.lookup("claude-opus-4").unwrap().input_per_1m_tokens, 3);
        assert_eq!(
            table.lookup("claude-opus-4-1").unwrap().input_per_1m_tokens,
            2
        );
        assert_eq!(
            table.lookup("claude-sonnet-4").unwrap().input_per_1m_tokens,
            1
        );
        assert!(table.lookup("gemini-2.5-pro").is_none());
    }

    #[tokio::test]
    async fn test_table_as_lookup_collaborator() {
        let table = PricingTable::builtin();
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 100,
            ..Default::default()
        };

        let cost = table.cost(&usage, "claude-opus-4").await.unwrap();
        assert!(cost.total_microcents > 0);

        let err = table.cost(&usage, "mistral-large").await.unwrap_err();
        assert!(matches!(err, PricingError::UnknownModel(_)));
    }
}
