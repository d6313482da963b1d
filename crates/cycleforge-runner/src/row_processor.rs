//! Runs a single row through prompt rendering, the LLM executor, and the
//! configured transform plugins.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cycleforge_core::model::{Record, RetryInfo, RowContext, ValueMap};
use cycleforge_core::security::SecurityLevel;
use cycleforge_core::traits::TransformPlugin;
use cycleforge_llm::{LlmExecutor, LlmExecutorError};
use cycleforge_prompts::{PromptEngine, PromptError, PromptTemplate};
use indexmap::IndexMap;
use serde_json::{json, Value};

/// A terminal row outcome, with the failure's source classified the way
/// the orchestrator's failure metadata distinguishes them: a template
/// problem carries no timestamp-worthy retry context, everything else does.
pub use cycleforge_core::model::Failure;

/// Processes one row: renders its prompt(s), drives the LLM executor, and
/// applies every configured transform plugin to the result.
pub struct RowProcessor {
    engine: Arc<PromptEngine>,
    system_template: PromptTemplate,
    user_template: PromptTemplate,
    criteria_templates: IndexMap<String, PromptTemplate>,
    transform_plugins: Vec<Arc<dyn TransformPlugin>>,
    criteria_names: Vec<String>,
    llm_executor: Arc<LlmExecutor>,
    security_level: Option<SecurityLevel>,
    cycle_name: String,
}

impl RowProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<PromptEngine>,
        system_template: PromptTemplate,
        user_template: PromptTemplate,
        criteria_templates: IndexMap<String, PromptTemplate>,
        transform_plugins: Vec<Arc<dyn TransformPlugin>>,
        criteria_names: Vec<String>,
        llm_executor: Arc<LlmExecutor>,
        security_level: Option<SecurityLevel>,
        cycle_name: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            system_template,
            user_template,
            criteria_templates,
            transform_plugins,
            criteria_names,
            llm_executor,
            security_level,
            cycle_name: cycle_name.into(),
        }
    }

    /// Returns `(Some(record), None)` on success or `(None, Some(failure))`
    /// on any terminal error. Never both, never neither.
    pub async fn process_row(&self, context: &RowContext, row_id: Option<&str>) -> (Option<Record>, Option<Failure>) {
        let context_value = context_to_value(context);

        let rendered_system = match self.engine.render(&self.system_template, &context_value, &ValueMap::new()) {
            Ok(rendered) => rendered,
            Err(err) => return (None, Some(prompt_failure(context, &err))),
        };

        let mut responses: IndexMap<String, cycleforge_core::model::LlmResponse> = IndexMap::new();

        if self.criteria_names.is_empty() {
            match self.render_and_call(&self.user_template, &context_value, &ValueMap::new(), &rendered_system, row_id).await {
                Ok(response) => {
                    responses.insert("default".to_string(), response);
                }
                Err(failure) => return (None, Some(with_row(failure, context))),
            }
        } else {
            for name in &self.criteria_names {
                let Some(template) = self.criteria_templates.get(name) else {
                    continue;
                };
                let mut extra = ValueMap::new();
                extra.insert("criteria".to_string(), json!(name));
                match self.render_and_call(template, &context_value, &extra, &rendered_system, row_id).await {
                    Ok(response) => {
                        responses.insert(name.clone(), response);
                    }
                    Err(failure) => return (None, Some(with_row(failure, context))),
                }
            }
        }

        let mut merged_metrics = ValueMap::new();
        for response in responses.values() {
            for (key, value) in &response.metrics {
                merged_metrics.insert(key.clone(), json!(value));
            }
        }

        // `response` is the first criterion's response in insertion order
        // (or the single response when there are no criteria); its retry
        // info, if any, is what the record carries.
        let first_response = responses.values().next().cloned().unwrap_or_default();
        let retry = first_response.retry.clone();

        let mut record = Record {
            row: context.clone(),
            response: first_response,
            responses: if self.criteria_names.is_empty() { IndexMap::new() } else { responses.clone() },
            metrics: merged_metrics,
            retry,
            security_level: self.security_level,
        };

        let transform_input = build_transform_input(&context_value, &responses);
        for plugin in &self.transform_plugins {
            let derived = plugin.transform(&transform_input);
            for (key, value) in derived {
                record.metrics.insert(key, value);
            }
        }

        (Some(record), None)
    }

    async fn render_and_call(
        &self,
        template: &PromptTemplate,
        context_value: &ValueMap,
        extra: &ValueMap,
        rendered_system: &str,
        row_id: Option<&str>,
    ) -> Result<cycleforge_core::model::LlmResponse, RowFailure> {
        let user_prompt = self.engine.render(template, context_value, extra).map_err(RowFailure::Prompt)?;

        let mut metadata = ValueMap::new();
        metadata.insert("row_id".to_string(), row_id.map(|id| json!(id)).unwrap_or(Value::Null));
        metadata.insert("cycle_name".to_string(), json!(self.cycle_name));
        for (key, value) in extra {
            metadata.insert(key.clone(), value.clone());
        }

        self.llm_executor.execute(&user_prompt, &metadata, rendered_system).await.map_err(RowFailure::Llm)
    }
}

/// Intermediate failure classification before `row` is attached: a prompt
/// problem carries no retry context, an exhausted LLM call does.
enum RowFailure {
    Prompt(PromptError),
    Llm(LlmExecutorError),
}

fn with_row(failure: RowFailure, context: &RowContext) -> Failure {
    match failure {
        RowFailure::Prompt(err) => prompt_failure(context, &err),
        RowFailure::Llm(err) => executor_failure(context, &err),
    }
}

fn prompt_failure(context: &RowContext, err: &PromptError) -> Failure {
    let error_type = match err {
        PromptError::Rendering(_) => "PromptRenderingError",
        PromptError::Validation(_) => "PromptValidationError",
    };
    Failure { row: context.clone(), error: err.to_string(), error_type: error_type.to_string(), timestamp: now_secs(), retry: None }
}

fn executor_failure(context: &RowContext, err: &LlmExecutorError) -> Failure {
    let retry = RetryInfo { attempts: err.attempts(), max_attempts: err.max_attempts(), history: err.history().to_vec() };
    Failure {
        row: context.clone(),
        error: err.to_string(),
        error_type: "LlmExecutorError".to_string(),
        timestamp: now_secs(),
        retry: Some(retry),
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

fn context_to_value(context: &RowContext) -> ValueMap {
    context.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Builds the `(row, responses)` input transform plugins receive, matching
/// `spec.md`'s `(row, responses_or_{default: response})` shape.
fn build_transform_input(context_value: &ValueMap, responses: &IndexMap<String, cycleforge_core::model::LlmResponse>) -> ValueMap {
    let mut input = ValueMap::new();
    input.insert("row".to_string(), Value::Object(context_value.clone()));
    let responses_value: ValueMap =
        responses.iter().map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(Value::Null))).collect();
    input.insert("responses".to_string(), Value::Object(responses_value));
    input
}
