//! The LLM executor (component C4): wraps a single LLM call with the
//! middleware chain, retry policy, rate-limit gate, and cost accounting.

use std::sync::Arc;
use std::time::Instant;

use cycleforge_core::model::{LlmRequest, LlmResponse, RetryAttempt, RetryConfig, RetryInfo, RetryStatus, ValueMap};
use cycleforge_core::traits::{LlmClient, LlmClientError, Middleware};
use serde_json::json;

use crate::cost_tracker::CostTracker;
use crate::rate_limiter::RateLimiter;

/// Raised when every retry attempt is exhausted. Carries the attempt
/// history as a first-class field rather than the exception-sidechannel
/// attachment the original uses (`_dmp_retry_history` etc.) — the
/// `Result` sum-type redesign named in `spec.md` §9.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlmExecutorError {
    #[error("LLM call failed after {attempts}/{max_attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        max_attempts: u32,
        history: Vec<RetryAttempt>,
        #[source]
        source: LlmClientError,
    },
}

impl LlmExecutorError {
    /// The retry history recorded before exhaustion, for callers that want
    /// it without matching on the enum.
    pub fn history(&self) -> &[RetryAttempt] {
        match self {
            LlmExecutorError::Exhausted { history, .. } => history,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            LlmExecutorError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            LlmExecutorError::Exhausted { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Wraps a single LLM call with the full middleware/retry/rate-limit/cost
/// pipeline described in `spec.md` §4.4.
pub struct LlmExecutor {
    llm_client: Arc<dyn LlmClient>,
    middlewares: Vec<Arc<dyn Middleware>>,
    retry_config: RetryConfig,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    cost_tracker: Option<Arc<dyn CostTracker>>,
    cycle_name: String,
}

impl LlmExecutor {
    pub fn new(
        llm_client: Arc<dyn LlmClient>,
        middlewares: Vec<Arc<dyn Middleware>>,
        retry_config: RetryConfig,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        cost_tracker: Option<Arc<dyn CostTracker>>,
        cycle_name: impl Into<String>,
    ) -> Self {
        Self { llm_client, middlewares, retry_config, rate_limiter, cost_tracker, cycle_name: cycle_name.into() }
    }

    pub async fn execute(
        &self,
        user_prompt: &str,
        metadata: &ValueMap,
        system_prompt: &str,
    ) -> Result<LlmResponse, LlmExecutorError> {
        let max_attempts = self.retry_config.max_attempts.max(1);
        let mut delay = self.retry_config.initial_delay_secs;
        let backoff = self.retry_config.backoff_multiplier;

        let mut attempt: u32 = 0;
        let mut history: Vec<RetryAttempt> = Vec::new();

        let (final_error, final_request) = loop {
            attempt += 1;
            let mut request_metadata = metadata.clone();
            request_metadata.insert("attempt".to_string(), json!(attempt));
            let mut request =
                LlmRequest { system_prompt: system_prompt.to_string(), user_prompt: user_prompt.to_string(), metadata: request_metadata };
            let attempt_start = Instant::now();

            for mw in &self.middlewares {
                request = mw.before_request(request);
            }

            let mut rate_limit_metadata = request.metadata.clone();
            rate_limit_metadata.insert("experiment".to_string(), json!(self.cycle_name));
            let _permit = match &self.rate_limiter {
                Some(limiter) => Some(limiter.acquire(&rate_limit_metadata).await),
                None => None,
            };

            let result = self.llm_client.generate(&request.system_prompt, &request.user_prompt, &request.metadata).await;
            drop(_permit);

            match result {
                Ok(mut response) => {
                    for mw in self.middlewares.iter().rev() {
                        response = mw.after_response(&request, response);
                    }

                    if let Some(tracker) = &self.cost_tracker {
                        let mut cost_metadata = request.metadata.clone();
                        cost_metadata.insert("experiment".to_string(), json!(self.cycle_name));
                        for (key, value) in tracker.record(&response, &cost_metadata) {
                            if let Some(number) = value.as_f64() {
                                response.metrics.insert(key, number);
                            }
                        }
                    }

                    let duration = attempt_start.elapsed().as_secs_f64().max(0.0);
                    history.push(RetryAttempt {
                        attempt,
                        status: RetryStatus::Success,
                        duration_secs: duration,
                        error: None,
                        error_type: None,
                        next_delay_secs: None,
                    });

                    response.metrics.insert("attempts_used".to_string(), f64::from(attempt));
                    response.retry = Some(RetryInfo { attempts: attempt, max_attempts, history: history.clone() });

                    if let Some(limiter) = &self.rate_limiter {
                        limiter.update_usage(&response, &request.metadata);
                    }

                    return Ok(response);
                }
                Err(err) => {
                    let duration = attempt_start.elapsed().as_secs_f64().max(0.0);
                    let error_message = err.to_string();
                    let error_type = error_type_name(&err);

                    if attempt >= max_attempts {
                        history.push(RetryAttempt {
                            attempt,
                            status: RetryStatus::Error,
                            duration_secs: duration,
                            error: Some(error_message),
                            error_type: Some(error_type),
                            next_delay_secs: None,
                        });
                        break (err, request);
                    }

                    let sleep_for = if delay > 0.0 { delay } else { 0.0 };
                    history.push(RetryAttempt {
                        attempt,
                        status: RetryStatus::Error,
                        duration_secs: duration,
                        error: Some(error_message),
                        error_type: Some(error_type),
                        next_delay_secs: Some(sleep_for),
                    });

                    if sleep_for > 0.0 {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_for)).await;
                    }
                    if backoff > 0.0 {
                        delay = if delay > 0.0 { delay * backoff } else { backoff };
                    }
                }
            }
        };

        self.notify_retry_exhausted(&final_request, &final_error, &history);
        Err(LlmExecutorError::Exhausted { attempts: attempt, max_attempts, history, source: final_error })
    }

    /// Middleware isolation: a panicking hook must not mask the original
    /// retry-exhaustion error.
    fn notify_retry_exhausted(&self, request: &LlmRequest, error: &LlmClientError, history: &[RetryAttempt]) {
        let mut hook_metadata = request.metadata.clone();
        hook_metadata.insert("experiment".to_string(), json!(self.cycle_name));
        hook_metadata.insert("attempts".to_string(), json!(history.len()));

        tracing::warn!(
            cycle = %self.cycle_name,
            attempts = history.len(),
            error = %error,
            "LLM request exhausted retries",
        );

        for mw in &self.middlewares {
            let mw_ref = mw.as_ref();
            let error_message = error.to_string();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                mw_ref.on_retry_exhausted(request, &hook_metadata, &error_message);
            }));
            if outcome.is_err() {
                tracing::debug!(middleware = mw_ref.name(), "retry-exhausted hook panicked");
            }
        }
    }
}

fn error_type_name(err: &LlmClientError) -> String {
    match err {
        LlmClientError::Generation(_) => "Generation".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for AlwaysFails {
        async fn generate(&self, _system: &str, _user: &str, _metadata: &ValueMap) -> Result<LlmResponse, LlmClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmClientError::Generation("boom".to_string()))
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl LlmClient for AlwaysSucceeds {
        async fn generate(&self, _system: &str, _user: &str, _metadata: &ValueMap) -> Result<LlmResponse, LlmClientError> {
            Ok(LlmResponse { content: Some("ok".to_string()), ..Default::default() })
        }
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_full_history() {
        let client = Arc::new(AlwaysFails { calls: AtomicU32::new(0) });
        let retry = RetryConfig { max_attempts: 3, initial_delay_secs: 0.0, backoff_multiplier: 1.0 };
        let executor = LlmExecutor::new(client.clone(), vec![], retry, None, None, "cycle1");

        let err = executor.execute("hi", &ValueMap::new(), "sys").await.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.max_attempts(), 3);
        assert_eq!(err.history().len(), 3);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn success_attaches_retry_info_and_attempts_used() {
        let client = Arc::new(AlwaysSucceeds);
        let executor = LlmExecutor::new(client, vec![], RetryConfig::default(), None, None, "cycle1");
        let response = executor.execute("hi", &ValueMap::new(), "sys").await.unwrap();
        let retry = response.retry.unwrap();
        assert_eq!(retry.attempts, 1);
        assert_eq!(response.metrics.get("attempts_used"), Some(&1.0));
    }
}
