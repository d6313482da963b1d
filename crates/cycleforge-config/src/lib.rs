//! # cycleforge-config
//!
//! The configuration merger (component C1): combines an ordered set of
//! named configuration sources under per-key merge strategies into one
//! effective map, with a retained trace supporting `explain(key)`.
//!
//! Merging is total — there is no error path here. Validating the merged
//! result (unknown plugin names, missing required prompts, non-mapping
//! option blocks) is the caller's responsibility, surfaced as
//! [`cycleforge_core::error::CoreError::Configuration`] at the component
//! that actually needs the value.

use std::collections::{BTreeMap, HashSet};

use cycleforge_core::model::ValueMap;
use serde_json::Value;

/// The per-key merge strategy, resolved by key name via a small static
/// registry. Keys absent from the registry default to [`MergeStrategy::Override`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The higher-precedence value wholly replaces the lower.
    Override,
    /// Result is concatenation in precedence order; every source that
    /// defines the key contributes its list, possibly empty, to the tail.
    Append,
    /// Recursive map union; on collision the higher-precedence value wins
    /// unless both sides are maps, in which case recursion continues.
    DeepMerge,
}

/// One named, precedence-tagged configuration layer.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub name: String,
    pub data: ValueMap,
    pub precedence: i64,
}

impl ConfigSource {
    pub fn new(name: impl Into<String>, data: ValueMap, precedence: i64) -> Self {
        Self { name: name.into(), data, precedence }
    }
}

/// Per-key provenance retained during a merge, supporting [`MergedConfig::explain`].
#[derive(Debug, Clone)]
struct MergeTrace {
    strategy: MergeStrategy,
    last_source: String,
    contributing_sources: Vec<String>,
}

/// The result of [`ConfigMerger::merge`]: the merged map plus enough trace
/// to answer "what set this key, and how".
#[derive(Debug, Clone)]
pub struct MergedConfig {
    value: ValueMap,
    traces: BTreeMap<String, MergeTrace>,
}

/// The answer to an [`MergedConfig::explain`] query.
#[derive(Debug, Clone)]
pub struct ConfigExplain {
    pub key: String,
    pub strategy: MergeStrategy,
    /// The source that last set this key (for APPEND/DEEP_MERGE, the last
    /// source to contribute to it).
    pub source: String,
    pub value: Value,
}

impl MergedConfig {
    /// The merged configuration map.
    pub fn value(&self) -> &ValueMap {
        &self.value
    }

    /// Consumes this result, returning the merged map.
    pub fn into_value(self) -> ValueMap {
        self.value
    }

    /// Explains how `key` reached its final value, or `None` if no source
    /// defined it.
    pub fn explain(&self, key: &str) -> Option<ConfigExplain> {
        let trace = self.traces.get(key)?;
        let value = self.value.get(key).cloned().unwrap_or(Value::Null);
        Some(ConfigExplain {
            key: key.to_string(),
            strategy: trace.strategy,
            source: trace.last_source.clone(),
            value,
        })
    }
}

/// Combines layered configuration sources under documented per-key
/// strategies, grounded on the merge semantics documented (but not, on
/// disk, actually implemented) in the original `config_merger.py` module
/// and stated authoritatively in this system's specification.
pub struct ConfigMerger {
    append_keys: HashSet<&'static str>,
    deep_merge_keys: HashSet<&'static str>,
}

impl Default for ConfigMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigMerger {
    /// Builds a merger with the default key-strategy registry.
    pub fn new() -> Self {
        let append_keys = [
            "row_plugins",
            "transform_plugin_defs",
            "aggregator_plugins",
            "aggregation_transform_defs",
            "baseline_plugins",
            "baseline_plugin_defs",
            "llm_middlewares",
            "llm_middleware_defs",
            "sinks",
            "sink_defs",
            "halt_condition_plugins",
            "halt_condition_plugin_defs",
        ]
        .into_iter()
        .collect();

        let deep_merge_keys = [
            "llm",
            "datasource",
            "prompts",
            "retry",
            "checkpoint",
            "concurrency",
            "early_stop",
        ]
        .into_iter()
        .collect();

        Self { append_keys, deep_merge_keys }
    }

    /// The strategy that applies to `key`.
    pub fn strategy_for(&self, key: &str) -> MergeStrategy {
        if self.append_keys.contains(key) {
            MergeStrategy::Append
        } else if self.deep_merge_keys.contains(key) {
            MergeStrategy::DeepMerge
        } else {
            MergeStrategy::Override
        }
    }

    /// Merges `sources`, sorted ascending by precedence (lower precedence
    /// applied first; equal-precedence sources keep their relative input
    /// order — a stable sort).
    pub fn merge(&self, sources: &[ConfigSource]) -> MergedConfig {
        let mut ordered: Vec<&ConfigSource> = sources.iter().collect();
        ordered.sort_by_key(|s| s.precedence);

        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for source in &ordered {
            for key in source.data.keys() {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
        }

        let mut value = ValueMap::new();
        let mut traces = BTreeMap::new();

        for key in keys {
            match self.strategy_for(&key) {
                MergeStrategy::Override => {
                    let mut last_source = None;
                    let mut final_value = Value::Null;
                    for source in &ordered {
                        if let Some(v) = source.data.get(&key) {
                            final_value = v.clone();
                            last_source = Some(source.name.clone());
                        }
                    }
                    if let Some(src) = last_source {
                        traces.insert(
                            key.clone(),
                            MergeTrace {
                                strategy: MergeStrategy::Override,
                                last_source: src.clone(),
                                contributing_sources: vec![src],
                            },
                        );
                        value.insert(key, final_value);
                    }
                }
                MergeStrategy::Append => {
                    let mut combined = Vec::new();
                    let mut contributors = Vec::new();
                    for source in &ordered {
                        if let Some(v) = source.data.get(&key) {
                            contributors.push(source.name.clone());
                            if let Some(arr) = v.as_array() {
                                combined.extend(arr.iter().cloned());
                            }
                        }
                    }
                    let last_source = contributors.last().cloned().unwrap_or_default();
                    traces.insert(
                        key.clone(),
                        MergeTrace { strategy: MergeStrategy::Append, last_source, contributing_sources: contributors },
                    );
                    value.insert(key, Value::Array(combined));
                }
                MergeStrategy::DeepMerge => {
                    let mut acc = Value::Object(ValueMap::new());
                    let mut contributors = Vec::new();
                    for source in &ordered {
                        if let Some(v) = source.data.get(&key) {
                            contributors.push(source.name.clone());
                            acc = deep_merge_value(acc, v.clone());
                        }
                    }
                    let last_source = contributors.last().cloned().unwrap_or_default();
                    traces.insert(
                        key.clone(),
                        MergeTrace { strategy: MergeStrategy::DeepMerge, last_source, contributing_sources: contributors },
                    );
                    value.insert(key, acc);
                }
            }
        }

        MergedConfig { value, traces }
    }
}

/// Recursive map union. `incoming` wins on any non-object collision;
/// neither input is mutated (both are consumed by value and a fresh tree
/// is built).
fn deep_merge_value(base: Value, incoming: Value) -> Value {
    match (base, incoming) {
        (Value::Object(mut base_map), Value::Object(incoming_map)) => {
            for (k, v) in incoming_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => deep_merge_value(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            Value::Object(base_map)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(name: &str, precedence: i64, data: Value) -> ConfigSource {
        let map = match data {
            Value::Object(m) => m,
            _ => panic!("source data must be an object"),
        };
        ConfigSource::new(name, map, precedence)
    }

    #[test]
    fn override_keeps_highest_precedence_value() {
        let merger = ConfigMerger::new();
        let sources = vec![
            source("defaults", 1, json!({"model": "a"})),
            source("cycle", 5, json!({"model": "b"})),
        ];
        let merged = merger.merge(&sources);
        assert_eq!(merged.value().get("model"), Some(&json!("b")));
        let explain = merged.explain("model").unwrap();
        assert_eq!(explain.source, "cycle");
    }

    #[test]
    fn append_concatenates_without_dedup() {
        let merger = ConfigMerger::new();
        let sources = vec![
            source("defaults", 1, json!({"sinks": [{"name": "a"}]})),
            source("cycle", 5, json!({"sinks": [{"name": "a"}]})),
        ];
        let merged = merger.merge(&sources);
        let sinks = merged.value().get("sinks").unwrap().as_array().unwrap();
        assert_eq!(sinks.len(), 2);
    }

    #[test]
    fn append_length_equals_sum_of_source_lengths() {
        let merger = ConfigMerger::new();
        let sources = vec![
            source("a", 1, json!({"sink_defs": [1, 2, 3]})),
            source("b", 2, json!({"sink_defs": []})),
            source("c", 3, json!({"sink_defs": [4]})),
        ];
        let merged = merger.merge(&sources);
        assert_eq!(merged.value().get("sink_defs").unwrap().as_array().unwrap().len(), 4);
    }

    #[test]
    fn deep_merge_unions_recursively() {
        let merger = ConfigMerger::new();
        let sources = vec![
            source("defaults", 1, json!({"llm": {"timeout": 30, "nested": {"a": 1}}})),
            source("cycle", 5, json!({"llm": {"model": "gpt", "nested": {"b": 2}}})),
        ];
        let merged = merger.merge(&sources);
        let llm = merged.value().get("llm").unwrap();
        assert_eq!(llm.get("timeout"), Some(&json!(30)));
        assert_eq!(llm.get("model"), Some(&json!("gpt")));
        assert_eq!(llm.get("nested").unwrap().get("a"), Some(&json!(1)));
        assert_eq!(llm.get("nested").unwrap().get("b"), Some(&json!(2)));
    }

    #[test]
    fn deep_merge_does_not_mutate_inputs() {
        let merger = ConfigMerger::new();
        let base = source("defaults", 1, json!({"retry": {"max_attempts": 3}}));
        let top = source("cycle", 5, json!({"retry": {"max_attempts": 5}}));
        let sources = vec![base.clone(), top.clone()];
        let _merged = merger.merge(&sources);
        assert_eq!(base.data.get("retry").unwrap().get("max_attempts"), Some(&json!(3)));
        assert_eq!(top.data.get("retry").unwrap().get("max_attempts"), Some(&json!(5)));
    }

    #[test]
    fn unknown_keys_default_to_override() {
        let merger = ConfigMerger::new();
        assert_eq!(merger.strategy_for("some_custom_key"), MergeStrategy::Override);
    }

    #[test]
    fn merge_is_idempotent_in_source_order_for_override() {
        let merger = ConfigMerger::new();
        let a = source("a", 1, json!({"name": "x"}));
        let b = source("b", 2, json!({"name": "y"}));
        let first = merger.merge(&[a.clone(), b.clone()]);
        let second = merger.merge(&[a, b]);
        assert_eq!(first.value(), second.value());
    }

    #[test]
    fn associativity_for_override_and_deep_merge() {
        let merger = ConfigMerger::new();
        let defaults = source("defaults", 1, json!({"model": "a", "retry": {"x": 1}}));
        let pack = source("pack", 2, json!({"model": "b", "retry": {"y": 2}}));
        let profile = source("profile", 3, json!({"model": "c", "retry": {"z": 3}}));

        let flat = merger.merge(&[defaults.clone(), pack.clone(), profile.clone()]);

        let inner = merger.merge(&[pack, profile]);
        let inner_sources: Vec<ConfigSource> = vec![
            defaults,
            ConfigSource::new("pack+profile", inner.into_value(), 2),
        ];
        let nested = merger.merge(&inner_sources);

        assert_eq!(flat.value().get("model"), nested.value().get("model"));
        assert_eq!(flat.value().get("retry"), nested.value().get("retry"));
    }
}
