//! Explicit construction registry for rate limiters and cost trackers,
//! replacing the process-wide plugin dictionaries of the original with
//! registries built once per run, per `spec.md` §9's dynamic-plugin-registry
//! redesign note.

use std::sync::Arc;

use cycleforge_core::model::PluginDef;

use crate::cost_tracker::{CostTracker, FixedPriceCostTracker, NoopCostTracker};
use crate::rate_limiter::{AdaptiveRateLimiter, FixedWindowRateLimiter, NoopRateLimiter, RateLimiter};

/// Raised when a `PluginDef` names a rate limiter/cost tracker this
/// registry doesn't recognize, or supplies invalid options.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct LlmConfigError(pub String);

/// Builds the rate limiter named by `def`, or `None` if `def` is absent.
pub fn create_rate_limiter(def: Option<&PluginDef>) -> Result<Option<Arc<dyn RateLimiter>>, LlmConfigError> {
    let Some(def) = def else { return Ok(None) };
    let limiter: Arc<dyn RateLimiter> = match def.name.as_str() {
        "noop" => Arc::new(NoopRateLimiter),
        "fixed_window" => {
            let requests = option_u32(def, "requests").unwrap_or(1);
            let per_seconds = option_f64(def, "per_seconds").unwrap_or(1.0);
            Arc::new(
                FixedWindowRateLimiter::new(requests, per_seconds)
                    .map_err(|e| LlmConfigError(e.0))?,
            )
        }
        "adaptive" => {
            let requests_per_minute = option_u32(def, "requests_per_minute")
                .or_else(|| option_u32(def, "requests"))
                .unwrap_or(60);
            let tokens_per_minute = def.options.get("tokens_per_minute").and_then(|v| v.as_u64());
            let interval_seconds = option_f64(def, "interval_seconds").unwrap_or(60.0);
            Arc::new(
                AdaptiveRateLimiter::new(requests_per_minute, tokens_per_minute, interval_seconds)
                    .map_err(|e| LlmConfigError(e.0))?,
            )
        }
        other => return Err(LlmConfigError(format!("unknown rate limiter plugin '{other}'"))),
    };
    Ok(Some(limiter))
}

/// Builds the cost tracker named by `def`, or `None` if `def` is absent.
pub fn create_cost_tracker(def: Option<&PluginDef>) -> Result<Option<Arc<dyn CostTracker>>, LlmConfigError> {
    let Some(def) = def else { return Ok(None) };
    let tracker: Arc<dyn CostTracker> = match def.name.as_str() {
        "noop" => Arc::new(NoopCostTracker),
        "fixed_price" => {
            let prompt_token_price = option_f64(def, "prompt_token_price").unwrap_or(0.0);
            let completion_token_price = option_f64(def, "completion_token_price").unwrap_or(0.0);
            Arc::new(FixedPriceCostTracker::new(prompt_token_price, completion_token_price))
        }
        other => return Err(LlmConfigError(format!("unknown cost tracker plugin '{other}'"))),
    };
    Ok(Some(tracker))
}

fn option_u32(def: &PluginDef, key: &str) -> Option<u32> {
    def.options.get(key).and_then(|v| v.as_u64()).and_then(|v| u32::try_from(v).ok())
}

fn option_f64(def: &PluginDef, key: &str) -> Option<f64> {
    def.options.get(key).and_then(|v| v.as_f64())
}
