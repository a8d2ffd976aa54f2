//! Token and cost estimation.
//!
//! Prices are USD per million tokens. Unknown models cost zero rather than
//! failing; the estimate is informational only.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::QualityTier;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const PRICE_TABLE: &[(&str, ModelPricing)] = &[
    ("claude-sonnet-4-5-20250929", ModelPricing { input_per_million: 3.00, output_per_million: 15.00 }),
    ("claude-haiku-4-5-20251001", ModelPricing { input_per_million: 0.80, output_per_million: 4.00 }),
    ("claude-opus-4-6", ModelPricing { input_per_million: 15.00, output_per_million: 75.00 }),
    ("gpt-4o", ModelPricing { input_per_million: 2.50, output_per_million: 10.00 }),
    ("gpt-4o-mini", ModelPricing { input_per_million: 0.15, output_per_million: 0.60 }),
    ("gemini-2.0-flash", ModelPricing { input_per_million: 0.10, output_per_million: 0.40 }),
    ("gemini-1.5-pro", ModelPricing { input_per_million: 1.25, output_per_million: 5.00 }),
];

/// Rough blended rates used when no specific model is known.
const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_million: 3.0,
    output_per_million: 15.0,
};
const EMBEDDING_PER_MILLION: f64 = 0.10;
const ARCHITECTURE_INPUT_TOKENS_PER_FILE: u64 = 200;
const ARCHITECTURE_OUTPUT_TOKENS: u64 = 2000;

/// Look up a model's price. Provider prefixes such as `openai/` are ignored.
pub fn pricing(model: &str) -> Option<ModelPricing> {
    let bare = model.rsplit('/').next().unwrap_or(model);
    PRICE_TABLE
        .iter()
        .find(|(name, _)| *name == bare)
        .map(|(_, p)| *p)
}

fn cost_of(pricing: ModelPricing, input_tokens: u64, output_tokens: u64) -> f64 {
    input_tokens as f64 / 1_000_000.0 * pricing.input_per_million
        + output_tokens as f64 / 1_000_000.0 * pricing.output_per_million
}

/// Cost in USD of a model call volume; 0 for models not in the table.
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    pricing(model)
        .map(|p| cost_of(p, input_tokens, output_tokens))
        .unwrap_or(0.0)
}

/// About one token per four bytes; at least 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    tokens_for_bytes(text.len() as u64)
}

fn tokens_for_bytes(len: u64) -> u64 {
    match len / 4 {
        0 if len > 0 => 1,
        n => n,
    }
}

/// Projected cost of analyzing a set of files.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostEstimate {
    pub total_files: usize,
    pub total_tokens_estimate: u64,
    pub estimated_cost: f64,
    /// Keyed by operation: `analysis`, `embeddings`, `architecture`.
    pub cost_breakdown: BTreeMap<String, f64>,
}

/// Estimate the cost of analyzing files of the given byte sizes at `tier`.
pub fn estimate_run(sizes: &[u64], tier: QualityTier) -> CostEstimate {
    let files = sizes.len() as u64;
    let input_tokens: u64 = sizes.iter().map(|&s| tokens_for_bytes(s)).sum();
    let output_tokens = files * tier.output_tokens_per_file();

    let mut breakdown = BTreeMap::new();
    let mut analysis = cost_of(DEFAULT_PRICING, input_tokens, output_tokens);
    breakdown.insert("analysis".to_string(), analysis);

    // Embeddings cover summaries, roughly half the source volume.
    let embeddings = (input_tokens / 2) as f64 / 1_000_000.0 * EMBEDDING_PER_MILLION;
    breakdown.insert("embeddings".to_string(), embeddings);

    if tier != QualityTier::Lite && files > 0 {
        let architecture = cost_of(
            DEFAULT_PRICING,
            files * ARCHITECTURE_INPUT_TOKENS_PER_FILE,
            ARCHITECTURE_OUTPUT_TOKENS,
        );
        breakdown.insert("architecture".to_string(), architecture);
        analysis += architecture;
    }

    CostEstimate {
        total_files: sizes.len(),
        total_tokens_estimate: input_tokens + output_tokens,
        estimated_cost: analysis + embeddings,
        cost_breakdown: breakdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_estimate_cost_known_and_unknown() {
        assert!(approx(estimate_cost("gpt-4o", 1_000_000, 1_000_000), 12.5));
        assert!(approx(estimate_cost("openai/gpt-4o-mini", 2_000_000, 0), 0.30));
        assert_eq!(estimate_cost("mystery-model", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_estimate_run_lite() {
        let est = estimate_run(&[4000, 4000], QualityTier::Lite);
        assert_eq!(est.total_files, 2);
        // 2000 input + 2 * 500 output
        assert_eq!(est.total_tokens_estimate, 3000);
        assert!(!est.cost_breakdown.contains_key("architecture"));
        let analysis = 2000.0 / 1e6 * 3.0 + 1000.0 / 1e6 * 15.0;
        let embeddings = 1000.0 / 1e6 * 0.10;
        assert!(approx(est.cost_breakdown["analysis"], analysis));
        assert!(approx(est.estimated_cost, analysis + embeddings));
    }

    #[test]
    fn test_estimate_run_normal_adds_architecture() {
        let est = estimate_run(&[4000], QualityTier::Normal);
        let architecture = 200.0 / 1e6 * 3.0 + 2000.0 / 1e6 * 15.0;
        assert!(approx(est.cost_breakdown["architecture"], architecture));
        let analysis = 1000.0 / 1e6 * 3.0 + 1500.0 / 1e6 * 15.0;
        let embeddings = 500.0 / 1e6 * 0.10;
        assert!(approx(est.estimated_cost, analysis + architecture + embeddings));
    }

    #[test]
    fn test_estimate_run_counts_tiny_files() {
        let est = estimate_run(&[3, 0], QualityTier::Lite);
        // 1 input token for the 3-byte file, none for the empty one.
        assert_eq!(est.total_tokens_estimate, 1 + 2 * 500);
    }

    #[test]
    fn test_estimate_run_empty() {
        let est = estimate_run(&[], QualityTier::Max);
        assert_eq!(est.total_files, 0);
        assert_eq!(est.estimated_cost, 0.0);
        assert!(!est.cost_breakdown.contains_key("architecture"));
    }
}
