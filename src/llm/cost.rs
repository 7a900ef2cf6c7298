//! Token usage and spend accounting per model.
//!
//! Totals only grow for the lifetime of the process.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Rate applied to models missing from the table. Deliberately on the expensive side.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(3.0, 15.0);

const KNOWN_PRICING: &[(&str, ModelPricing)] = &[
    ("deepseek/deepseek-v3.2-exp", ModelPricing::new(0.27, 0.40)),
    ("deepseek/deepseek-chat", ModelPricing::new(0.30, 0.85)),
    ("anthropic/claude-3.5-sonnet", ModelPricing::new(3.0, 15.0)),
    ("anthropic/claude-3-haiku", ModelPricing::new(0.25, 1.25)),
    ("openai/gpt-4o", ModelPricing::new(2.5, 10.0)),
    ("openai/gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
    ("google/gemini-flash-1.5", ModelPricing::new(0.075, 0.30)),
    ("meta-llama/llama-3.1-8b-instruct", ModelPricing::new(0.05, 0.05)),
];

/// Token counts reported for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Accumulated usage for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

/// Read-only snapshot returned by [`CostTracker::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostStats {
    pub per_model: BTreeMap<String, ModelUsage>,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Process-wide spend accounting shared by every LLM caller.
#[derive(Debug)]
pub struct CostTracker {
    pricing: HashMap<String, ModelPricing>,
    usage: Mutex<CostStats>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    pub fn new() -> Self {
        Self::with_pricing(
            KNOWN_PRICING
                .iter()
                .map(|(model, pricing)| (model.to_string(), *pricing)),
        )
    }

    pub fn with_pricing(pricing: impl IntoIterator<Item = (String, ModelPricing)>) -> Self {
        Self {
            pricing: pricing.into_iter().collect(),
            usage: Mutex::new(CostStats::default()),
        }
    }

    fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing.get(model).copied().unwrap_or(DEFAULT_PRICING)
    }

    /// Estimated USD cost of a call. Unknown models use [`DEFAULT_PRICING`].
    pub fn calculate_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let pricing = self.pricing_for(model);
        (prompt_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (completion_tokens as f64 / 1_000_000.0) * pricing.output_per_million
    }

    /// Add one call's usage to the per-model and aggregate totals.
    pub fn record_usage(&self, model: &str, cost: f64, tokens: TokenUsage) {
        // Negative or NaN costs would break monotonic totals.
        let cost = if cost.is_finite() && cost > 0.0 { cost } else { 0.0 };

        let mut stats = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.per_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.prompt_tokens += tokens.prompt_tokens as u64;
        entry.completion_tokens += tokens.completion_tokens as u64;
        entry.cost += cost;

        stats.total_requests += 1;
        stats.total_tokens += tokens.total() as u64;
        stats.total_cost += cost;
        debug!(model, cost, total_cost = stats.total_cost, "Recorded LLM usage");
    }

    pub fn get_stats(&self) -> CostStats {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_cost(&self) -> f64 {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_pricing() {
        let tracker = CostTracker::new();
        let cost = tracker.calculate_cost("openai/gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default_rate() {
        let tracker = CostTracker::new();
        let cost = tracker.calculate_cost("some/new-model", 2_000_000, 0);
        assert!((cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_totals_equal_sum_of_calls_and_never_decrease() {
        let tracker = CostTracker::new();
        let calls = [
            ("deepseek/deepseek-v3.2-exp", 1_200, 800),
            ("openai/gpt-4o-mini", 300, 90),
            ("deepseek/deepseek-v3.2-exp", 2_000, 1_500),
        ];

        let mut expected = 0.0;
        let mut previous = 0.0;
        for (model, prompt, completion) in calls {
            let cost = tracker.calculate_cost(model, prompt, completion);
            expected += cost;
            tracker.record_usage(
                model,
                cost,
                TokenUsage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                },
            );
            let total = tracker.get_stats().total_cost;
            assert!(total >= previous);
            previous = total;
        }

        let stats = tracker.get_stats();
        assert!((stats.total_cost - expected).abs() < 1e-12);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_tokens, 1_200 + 800 + 300 + 90 + 2_000 + 1_500);
        assert_eq!(stats.per_model["deepseek/deepseek-v3.2-exp"].requests, 2);
    }

    #[test]
    fn test_negative_cost_is_ignored() {
        let tracker = CostTracker::new();
        tracker.record_usage("x", 0.5, TokenUsage::default());
        tracker.record_usage("x", -1.0, TokenUsage::default());
        tracker.record_usage("x", f64::NAN, TokenUsage::default());
        assert!((tracker.total_cost() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_get_stats_has_no_side_effects() {
        let tracker = CostTracker::new();
        tracker.record_usage("x", 0.1, TokenUsage::default());
        assert_eq!(tracker.get_stats(), tracker.get_stats());
    }
}
