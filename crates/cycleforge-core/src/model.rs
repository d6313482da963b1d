//! Row/record/failure/artifact/config value types shared by every component.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::security::SecurityLevel;

/// A generic free-form value map, used wherever the specification says
/// `map<string, value>`. Backed by `serde_json::Map`, which preserves
/// insertion order (the workspace enables `serde_json`'s `preserve_order`
/// feature for exactly this reason).
pub type ValueMap = Map<String, Value>;

/// An ordered, immutable mapping from field name to value derived from one
/// tabular input record.
///
/// Construction is the only mutation point: `RowContext::new` takes
/// ownership of the full row, and [`RowContext::restricted_to`] produces a
/// *new* context containing only the declared subset, preserving the
/// subset's relative order from the original row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowContext {
    fields: IndexMap<String, Value>,
}

impl RowContext {
    /// Builds a context from a full row of fields.
    pub fn new(fields: IndexMap<String, Value>) -> Self {
        Self { fields }
    }

    /// Restricts this context to the given field subset, preserving the
    /// order fields appear in the original row. Fields absent from the row
    /// are silently skipped.
    pub fn restricted_to(&self, keep: &[String]) -> RowContext {
        if keep.is_empty() {
            return self.clone();
        }
        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| keep.iter().any(|f| f == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        RowContext { fields }
    }

    /// Reads a field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Iterates fields in row order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// The number of fields in this context.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if this context has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single LLM call's outcome history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub status: RetryStatus,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_delay_secs: Option<f64>,
}

/// Terminal status of one retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Success,
    Error,
}

/// Retry bookkeeping attached to a [`Record`], [`Failure`], or [`LlmResponse`].
///
/// Invariant: `history.len() == attempts`; the last entry's status
/// determines the terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub attempts: u32,
    pub max_attempts: u32,
    pub history: Vec<RetryAttempt>,
}

impl RetryInfo {
    /// `Σ max(attempts_i - 1, 0)` for this single retry record.
    pub fn retries(&self) -> u64 {
        u64::from(self.attempts.saturating_sub(1))
    }
}

/// A single outbound LLM request. Clonable because middleware may derive
/// new requests from an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub metadata: ValueMap,
}

/// An LLM call's result, as returned by a [`crate::traits::LlmClient`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
}

/// A successful row outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub row: RowContext,
    pub response: LlmResponse,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub responses: IndexMap<String, LlmResponse>,
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub metrics: ValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
}

/// A terminal row outcome. Never becomes a [`Record`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub row: RowContext,
    pub error: String,
    pub error_type: String,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
}

/// The resolution mode for an [`ArtifactRequest`] token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    Single,
    All,
}

/// A sink's declared dependency on another sink's output, expressed as a
/// token: `@<alias>` resolves by alias/name, anything else resolves by
/// `type-prefix/subtype`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub token: String,
    pub mode: RequestMode,
}

impl ArtifactRequest {
    /// Parses a raw token string into a request. The `mode` is caller
    /// supplied (the wire form does not encode single/all; that comes from
    /// the surrounding config shape, e.g. a scalar vs. a list entry).
    pub fn new(token: impl Into<String>, mode: RequestMode) -> Self {
        Self { token: token.into(), mode }
    }

    /// True if this token is an alias reference (`@name`) rather than a type.
    pub fn is_alias(&self) -> bool {
        self.token.starts_with('@')
    }

    /// The alias name with the leading `@` stripped, if this is an alias token.
    pub fn alias_name(&self) -> Option<&str> {
        self.token.strip_prefix('@')
    }
}

/// A statically declared artifact a sink may produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub persist: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
}

impl ArtifactDescriptor {
    /// Validates `type` against the `{file/*, data/*}` prefix grammar.
    pub fn validate_type(type_: &str) -> Result<(), InvalidArtifactType> {
        if type_.starts_with("file/") || type_.starts_with("data/") {
            Ok(())
        } else {
            Err(InvalidArtifactType(type_.to_string()))
        }
    }
}

/// Raised when an artifact `type` does not start with `file/` or `data/`.
#[derive(Debug, thiserror::Error)]
#[error("artifact type '{0}' must start with 'file/' or 'data/'")]
pub struct InvalidArtifactType(pub String);

/// A runtime artifact instance produced by a sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub metadata: ValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub produced_by: String,
    pub persist: bool,
    pub security_level: SecurityLevel,
}

/// A sink paired with its static/dynamic artifact declarations and its
/// original configured index (used for stable topological tie-breaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkBindingMeta {
    pub id: String,
    pub plugin: String,
    pub artifact_config: ValueMap,
    pub original_index: usize,
    pub produces: Vec<ArtifactDescriptor>,
    pub consumes: Vec<ArtifactRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
}

/// The effective, post-merge configuration for a single cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleConfig {
    pub name: String,
    #[serde(default)]
    pub prompt_system: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub prompt_fields: Vec<String>,
    #[serde(default)]
    pub prompt_defaults: ValueMap,
    /// Preserved per the field's Open Question resolution: threaded through
    /// the config surface but intentionally left unwired into rendering.
    #[serde(default)]
    pub prompt_aliases: ValueMap,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub transform_plugin_defs: Vec<PluginDef>,
    #[serde(default)]
    pub aggregation_transform_defs: Vec<PluginDef>,
    #[serde(default)]
    pub sink_defs: Vec<PluginDef>,
    #[serde(default)]
    pub llm_middleware_defs: Vec<PluginDef>,
    #[serde(default)]
    pub halt_condition_plugin_defs: Vec<PluginDef>,
    #[serde(default)]
    pub baseline_plugin_defs: Vec<PluginDef>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub rate_limiter: Option<PluginDef>,
    #[serde(default)]
    pub cost_tracker: Option<PluginDef>,
    #[serde(default)]
    pub security_level: Option<SecurityLevel>,
    #[serde(default)]
    pub metadata: ValueMap,
}

/// A named plugin instantiation request: `{name, options}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDef {
    pub name: String,
    #[serde(default)]
    pub options: ValueMap,
}

/// Retry policy for the LLM executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: f64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 1, initial_delay_secs: 0.0, backoff_multiplier: 1.0 }
    }
}

/// Parallel-dispatch configuration for the cycle runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub enabled: bool,
    pub max_workers: usize,
    pub backlog_threshold: usize,
    pub utilization_pause: f64,
    pub pause_interval_secs: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: 1,
            backlog_threshold: 50,
            utilization_pause: 0.8,
            pause_interval_secs: 0.5,
        }
    }
}

/// Checkpoint file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
    #[serde(default = "default_checkpoint_field")]
    pub field: String,
}

fn default_checkpoint_path() -> String {
    "checkpoint.jsonl".to_string()
}

fn default_checkpoint_field() -> String {
    "APPID".to_string()
}

/// One input row plus its stable original position, produced by the
/// backlog-build step.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub original_index: usize,
    pub row_id: String,
    pub context: RowContext,
}

/// The tabular input to a cycle: a finite, restartable sequence of rows plus
/// an attribute map the core consults for `security_level`.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<IndexMap<String, Value>>,
    pub attributes: ValueMap,
}

impl Batch {
    pub fn security_level(&self) -> Option<&str> {
        self.attributes.get("security_level").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> RowContext {
        let mut fields = IndexMap::new();
        for (k, v) in pairs {
            fields.insert((*k).to_string(), Value::String((*v).to_string()));
        }
        RowContext::new(fields)
    }

    #[test]
    fn restricted_to_preserves_row_order() {
        let row = ctx(&[("id", "1"), ("text", "a"), ("extra", "z")]);
        let restricted = row.restricted_to(&["extra".to_string(), "id".to_string()]);
        let keys: Vec<&String> = restricted.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["id", "extra"]);
    }

    #[test]
    fn restricted_to_empty_keeps_everything() {
        let row = ctx(&[("id", "1"), ("text", "a")]);
        assert_eq!(row.restricted_to(&[]).len(), 2);
    }

    #[test]
    fn retry_info_retries_count() {
        let info = RetryInfo {
            attempts: 3,
            max_attempts: 3,
            history: vec![],
        };
        assert_eq!(info.retries(), 2);
    }

    #[test]
    fn artifact_type_validation() {
        assert!(ArtifactDescriptor::validate_type("file/csv").is_ok());
        assert!(ArtifactDescriptor::validate_type("data/json").is_ok());
        assert!(ArtifactDescriptor::validate_type("csv").is_err());
    }
}
