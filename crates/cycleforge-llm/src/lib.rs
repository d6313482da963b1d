//! LLM executor (component C4): retry/backoff loop, middleware chain,
//! rate-limit gate, and cost accounting around a single [`LlmClient`] call.

pub mod cost_tracker;
pub mod executor;
pub mod rate_limiter;
pub mod registry;

pub use cost_tracker::{CostTracker, FixedPriceCostTracker, NoopCostTracker};
pub use executor::{LlmExecutor, LlmExecutorError};
pub use rate_limiter::{AdaptiveRateLimiter, FixedWindowRateLimiter, NoopRateLimiter, RateLimitPermit, RateLimiter, RateLimiterConfigError};
pub use registry::{create_cost_tracker, create_rate_limiter, LlmConfigError};
