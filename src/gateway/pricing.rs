//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token. Used for usage records
//! only; nothing gates on cost.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::types::TokenUsage;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    ///
    /// Cache reads bill at 10% of the input rate, cache writes at 125%.
    pub fn calculate_cost(&self, usage: &TokenUsage) -> i64 {
        let cache_read = usage.cache_read_input_tokens.unwrap_or(0) as i64;
        let cache_write = usage.cache_creation_input_tokens.unwrap_or(0) as i64;
        (usage.input_tokens as i64) * self.input_nanos_per_token
            + (usage.output_tokens as i64) * self.output_nanos_per_token
            + cache_read * self.input_nanos_per_token / 10
            + cache_write * self.input_nanos_per_token * 5 / 4
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Claude Haiku 4.5: $1.00/1M input, $5.00/1M output
// Claude Sonnet 4.5: $3.00/1M input, $15.00/1M output
// Claude Opus 4.1: $15.00/1M input, $75.00/1M output

const CLAUDE_HAIKU_4_5: ModelPricing = ModelPricing::new(1_000, 5_000);
const CLAUDE_SONNET_4_5: ModelPricing = ModelPricing::new(3_000, 15_000);
const CLAUDE_OPUS_4_1: ModelPricing = ModelPricing::new(15_000, 75_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("claude-haiku-4-5", CLAUDE_HAIKU_4_5);
    map.insert("claude-haiku-4-5-20251001", CLAUDE_HAIKU_4_5);
    map.insert("claude-sonnet-4-5", CLAUDE_SONNET_4_5);
    map.insert("claude-sonnet-4-5-20250929", CLAUDE_SONNET_4_5);
    map.insert("claude-sonnet-4-20250514", CLAUDE_SONNET_4_5);
    map.insert("claude-opus-4-1", CLAUDE_OPUS_4_1);
    map.insert("claude-opus-4-1-20250805", CLAUDE_OPUS_4_1);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate message cost, defaulting to Sonnet rates for unknown models.
pub fn message_cost(model: &str, usage: &TokenUsage) -> i64 {
    get_pricing(model)
        .unwrap_or(CLAUDE_SONNET_4_5)
        .calculate_cost(usage)
}
