//! Cost tracker implementations: a no-op and a fixed per-token pricing
//! tracker with thread-safe running totals.

use cycleforge_core::model::{LlmResponse, ValueMap};
use parking_lot::Mutex;
use serde_json::json;

/// Records per-call cost metrics and aggregates totals across a run.
pub trait CostTracker: Send + Sync {
    /// Returns cost metrics for this single call; merged into the
    /// response's `metrics` by the executor.
    fn record(&self, response: &LlmResponse, metadata: &ValueMap) -> ValueMap;

    /// Cumulative totals across every `record` call so far.
    fn summary(&self) -> ValueMap;
}

/// Tracks nothing; `record`/`summary` both return an empty map.
#[derive(Debug, Default)]
pub struct NoopCostTracker;

impl CostTracker for NoopCostTracker {
    fn record(&self, _response: &LlmResponse, _metadata: &ValueMap) -> ValueMap {
        ValueMap::new()
    }

    fn summary(&self) -> ValueMap {
        ValueMap::new()
    }
}

#[derive(Default)]
struct FixedPriceState {
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
    total_cost: f64,
}

/// Computes cost as `prompt_tokens * prompt_token_price + completion_tokens
/// * completion_token_price`, reading usage from `response.raw.usage`.
pub struct FixedPriceCostTracker {
    prompt_token_price: f64,
    completion_token_price: f64,
    state: Mutex<FixedPriceState>,
}

impl FixedPriceCostTracker {
    pub fn new(prompt_token_price: f64, completion_token_price: f64) -> Self {
        Self { prompt_token_price, completion_token_price, state: Mutex::new(FixedPriceState::default()) }
    }
}

impl CostTracker for FixedPriceCostTracker {
    fn record(&self, response: &LlmResponse, _metadata: &ValueMap) -> ValueMap {
        let (prompt_tokens, completion_tokens) = extract_usage(response.raw.as_ref());
        let cost = prompt_tokens as f64 * self.prompt_token_price + completion_tokens as f64 * self.completion_token_price;

        let mut state = self.state.lock();
        state.total_prompt_tokens += prompt_tokens;
        state.total_completion_tokens += completion_tokens;
        state.total_cost += cost;

        let mut out = ValueMap::new();
        out.insert("prompt_tokens".into(), json!(prompt_tokens));
        out.insert("completion_tokens".into(), json!(completion_tokens));
        out.insert("cost".into(), json!(cost));
        out
    }

    fn summary(&self) -> ValueMap {
        let state = self.state.lock();
        let mut out = ValueMap::new();
        out.insert("prompt_tokens".into(), json!(state.total_prompt_tokens));
        out.insert("completion_tokens".into(), json!(state.total_completion_tokens));
        out.insert("total_cost".into(), json!(state.total_cost));
        out
    }
}

fn extract_usage(raw: Option<&serde_json::Value>) -> (u64, u64) {
    let Some(usage) = raw.and_then(|r| r.get("usage")) else {
        return (0, 0);
    };
    let prompt = usage.get("prompt_tokens").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let completion = usage.get("completion_tokens").and_then(serde_json::Value::as_u64).unwrap_or(0);
    (prompt, completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fixed_price_computes_cost_and_accumulates() {
        let tracker = FixedPriceCostTracker::new(0.01, 0.02);
        let mut response = LlmResponse::default();
        response.raw = Some(json!({"usage": {"prompt_tokens": 100, "completion_tokens": 50}}));
        let metrics = tracker.record(&response, &ValueMap::new());
        assert_eq!(metrics.get("prompt_tokens"), Some(&json!(100)));
        assert!((metrics.get("cost").unwrap().as_f64().unwrap() - 2.0).abs() < 1e-9);

        tracker.record(&response, &ValueMap::new());
        let summary = tracker.summary();
        assert_eq!(summary.get("prompt_tokens"), Some(&json!(200)));
    }

    #[test]
    fn noop_returns_empty_maps() {
        let tracker = NoopCostTracker;
        let response = LlmResponse::default();
        assert!(tracker.record(&response, &ValueMap::new()).is_empty());
        assert!(tracker.summary().is_empty());
    }
}
