//! Model pricing and request cost computation.
//!
//! Prices come from the `model_prices` table (per million tokens, USD).
//! Models without a configured row fall back to a small built-in table
//! keyed by model-id prefix so accounting never silently records zero.

use crate::models::ModelPrice;
use crate::translate::NormalizedUsage;

/// Built-in fallback prices (input, output, cache-creation, cache-read per MTok).
const DEFAULT_PRICES: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus", 15.0, 75.0, 18.75, 1.5),
    ("claude-sonnet", 3.0, 15.0, 3.75, 0.3),
    ("claude-haiku", 0.8, 4.0, 1.0, 0.08),
    ("gpt-5", 1.25, 10.0, 0.0, 0.125),
    ("gpt-4", 2.0, 8.0, 0.0, 0.5),
    ("o3", 2.0, 8.0, 0.0, 0.5),
    ("gemini-2.5-pro", 1.25, 10.0, 0.0, 0.31),
    ("gemini", 0.3, 2.5, 0.0, 0.075),
    ("deepseek", 0.28, 0.42, 0.0, 0.028),
    ("qwen", 0.4, 1.2, 0.0, 0.1),
];

/// Fallback price for a model with no configured row.
pub fn default_price(model: &str) -> Option<ModelPrice> {
    let lower = model.to_ascii_lowercase();
    DEFAULT_PRICES
        .iter()
        .find(|(prefix, ..)| lower.starts_with(prefix))
        .map(|(_, input, output, cache_creation, cache_read)| ModelPrice {
            model: model.to_string(),
            input_per_mtok: *input,
            output_per_mtok: *output,
            cache_creation_per_mtok: *cache_creation,
            cache_read_per_mtok: *cache_read,
        })
}

/// Cost of one request in USD before the provider's cost multiplier.
pub fn base_cost(price: &ModelPrice, usage: &NormalizedUsage) -> f64 {
    let per_tok = |per_mtok: f64| per_mtok / 1_000_000.0;
    usage.input_tokens as f64 * per_tok(price.input_per_mtok)
        + usage.output_tokens as f64 * per_tok(price.output_per_mtok)
        + usage.cache_creation_tokens as f64 * per_tok(price.cache_creation_per_mtok)
        + usage.cache_read_tokens as f64 * per_tok(price.cache_read_per_mtok)
}

/// Final accounted cost: `cost_multiplier × token usage × price[model]`.
pub fn request_cost(price: &ModelPrice, usage: &NormalizedUsage, cost_multiplier: f64) -> f64 {
    base_cost(price, usage) * cost_multiplier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sonnet_happy_path_cost_lands_near_three_tenths_of_a_cent() {
        let price = default_price("claude-sonnet-4").unwrap();
        let usage = NormalizedUsage {
            input_tokens: 10,
            output_tokens: 198,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        };
        let cost = request_cost(&price, &usage, 1.0);
        assert!((cost - 0.003).abs() < 0.0005, "got {cost}");
    }

    #[test]
    fn multiplier_scales_cost() {
        let price = default_price("claude-haiku-3-5").unwrap();
        let usage = NormalizedUsage {
            input_tokens: 1000,
            output_tokens: 1000,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        };
        let base = request_cost(&price, &usage, 1.0);
        let doubled = request_cost(&price, &usage, 2.0);
        assert!((doubled - base * 2.0).abs() < 1e-12);
    }

    #[test]
    fn cache_tokens_are_priced_separately() {
        let price = ModelPrice {
            model: "m".into(),
            input_per_mtok: 1.0,
            output_per_mtok: 1.0,
            cache_creation_per_mtok: 2.0,
            cache_read_per_mtok: 0.5,
        };
        let usage = NormalizedUsage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_creation_tokens: 1_000_000,
            cache_read_tokens: 2_000_000,
        };
        let cost = base_cost(&price, &usage);
        assert!((cost - (1.0 + 2.0 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_has_no_default_price() {
        assert!(default_price("mystery-model").is_none());
        assert!(default_price("claude-sonnet-4-5").is_some());
    }
}
