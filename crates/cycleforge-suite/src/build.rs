//! The build-runner algorithm shared by every strategy: merge a cycle's
//! three configuration layers, validate the result, and materialize every
//! collaborator a [`CycleRunner`] needs. Grounded on
//! `StandardOrchestrator.build_runner` in the original, which both
//! strategies inherited unchanged.

use std::sync::Arc;

use cycleforge_config::{ConfigMerger, ConfigSource};
use cycleforge_core::model::{CycleConfig, PluginDef, ValueMap};
use cycleforge_core::security::SecurityLevel;
use cycleforge_core::traits::{HaltCondition, LlmClient, Middleware};
use cycleforge_llm::{create_cost_tracker, create_rate_limiter};
use cycleforge_plugins::{create_aggregation_plugin, create_halt_condition_plugin, create_transform_plugin};
use cycleforge_runner::CycleRunner;
use serde_json::{json, Value};

use crate::error::SuiteError;
use crate::middleware::MiddlewareCache;
use crate::plugins::SinkPluginBuilder;

/// Merges `defaults`/`pack`/`cycle_data` and constructs a live
/// [`CycleRunner`] plus the effective [`CycleConfig`] and the resolved
/// middleware instances (the orchestrator needs the latter for lifecycle
/// callbacks, which happen outside the runner).
#[allow(clippy::too_many_arguments)]
pub fn build_runner(
    defaults: &ValueMap,
    pack: Option<(&str, &ValueMap)>,
    cycle_name: &str,
    cycle_data: &ValueMap,
    llm_client: Arc<dyn LlmClient>,
    middlewares: &mut MiddlewareCache,
    sink_builder: &dyn SinkPluginBuilder,
    fallback_sink_defs: &[PluginDef],
) -> Result<(CycleRunner, CycleConfig, Vec<Arc<dyn Middleware>>), SuiteError> {
    let merger = ConfigMerger::new();
    let mut sources = vec![ConfigSource::new("defaults", defaults.clone(), 1)];
    if let Some((name, data)) = pack {
        sources.push(ConfigSource::new(name, data.clone(), 2));
    }
    sources.push(ConfigSource::new("cycle", cycle_data.clone(), 3));

    let mut value = merger.merge(&sources).into_value();
    value.insert("name".to_string(), Value::String(cycle_name.to_string()));
    apply_prompt_fallback(&mut value);
    normalize_halt_shorthand(&mut value);

    let config: CycleConfig = serde_json::from_value(Value::Object(value))
        .map_err(|e| SuiteError::configuration(cycle_name, format!("invalid cycle configuration: {e}")))?;

    if config.prompt_system.as_deref().unwrap_or("").trim().is_empty() {
        return Err(SuiteError::configuration(
            cycle_name,
            "no system prompt defined; provide one in the cycle, defaults, or prompt pack",
        ));
    }
    if config.prompt_template.as_deref().unwrap_or("").trim().is_empty() {
        return Err(SuiteError::configuration(
            cycle_name,
            "no user prompt defined; provide one in the cycle, defaults, or prompt pack",
        ));
    }

    let middleware_instances = middlewares.resolve(&config.llm_middleware_defs)?;

    let halt_plugins: Vec<Box<dyn HaltCondition>> =
        config.halt_condition_plugin_defs.iter().map(create_halt_condition_plugin).collect::<Result<_, _>>()?;

    let security_level = SecurityLevel::resolve([
        config.security_level.map(SecurityLevel::as_str),
        pack.and_then(|(_, data)| data.get("security_level")).and_then(Value::as_str),
        defaults.get("security_level").and_then(Value::as_str),
    ])?;

    let transform_plugins = config.transform_plugin_defs.iter().map(create_transform_plugin).collect::<Result<Vec<_>, _>>()?;
    let aggregation_plugins =
        config.aggregation_transform_defs.iter().map(create_aggregation_plugin).collect::<Result<Vec<_>, _>>()?;
    let rate_limiter = create_rate_limiter(config.rate_limiter.as_ref())?;
    let cost_tracker = create_cost_tracker(config.cost_tracker.as_ref())?;

    let sinks = match resolve_sink_defs(defaults, pack, cycle_data) {
        Some(defs) => build_sinks(sink_builder, &defs)?,
        None if !fallback_sink_defs.is_empty() => build_sinks(sink_builder, fallback_sink_defs)?,
        None => Vec::new(),
    };

    let runner = CycleRunner::new(
        config.clone(),
        llm_client,
        middleware_instances.clone(),
        rate_limiter,
        cost_tracker,
        transform_plugins,
        aggregation_plugins,
        halt_plugins,
        sinks,
        security_level,
    );

    Ok((runner, config, middleware_instances))
}

fn build_sinks(builder: &dyn SinkPluginBuilder, defs: &[PluginDef]) -> Result<Vec<cycleforge_artifacts::SinkBinding>, SuiteError> {
    defs.iter().enumerate().map(|(index, def)| builder.build(def, index)).collect()
}

/// Fills `prompt_system`/`prompt_template` from a `prompts: {system, user}`
/// block when the explicit top-level fields are absent or blank.
fn apply_prompt_fallback(value: &mut ValueMap) {
    let Some(Value::Object(prompts)) = value.get("prompts").cloned() else { return };

    let system_blank = value.get("prompt_system").and_then(Value::as_str).map_or(true, |s| s.trim().is_empty());
    if system_blank {
        if let Some(system) = prompts.get("system").and_then(Value::as_str) {
            value.insert("prompt_system".to_string(), Value::String(system.to_string()));
        }
    }

    let user_blank = value.get("prompt_template").and_then(Value::as_str).map_or(true, |s| s.trim().is_empty());
    if user_blank {
        if let Some(user) = prompts.get("user").and_then(Value::as_str) {
            value.insert("prompt_template".to_string(), Value::String(user.to_string()));
        }
    }
}

/// Normalizes a single `early_stop`/`halt_condition_config` shorthand map
/// into a one-element `halt_condition_plugin_defs` list, when no explicit
/// list is already present.
fn normalize_halt_shorthand(value: &mut ValueMap) {
    let has_explicit =
        value.get("halt_condition_plugin_defs").and_then(Value::as_array).map_or(false, |a| !a.is_empty());
    if has_explicit {
        return;
    }

    for key in ["early_stop", "halt_condition_config"] {
        let Some(Value::Object(obj)) = value.get(key).cloned() else { continue };
        if obj.is_empty() {
            continue;
        }
        let mut options = obj;
        let name = options.remove("name").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "threshold".to_string());
        value.insert("halt_condition_plugin_defs".to_string(), Value::Array(vec![json!({"name": name, "options": options})]));
        return;
    }
}

/// Resolves the sink definitions to instantiate, in the order `spec.md`
/// §4.6 names: the cycle's own defs, then the pack's, then the defaults'.
/// Unlike every other plugin-list key, sinks are **not** appended across
/// these layers — the most specific non-empty list wins outright.
fn resolve_sink_defs(defaults: &ValueMap, pack: Option<(&str, &ValueMap)>, cycle_data: &ValueMap) -> Option<Vec<PluginDef>> {
    for data in [Some(cycle_data), pack.map(|(_, data)| data), Some(defaults)] {
        let Some(data) = data else { continue };
        if let Some(defs) = sink_defs_from(data) {
            return Some(defs);
        }
    }
    None
}

fn sink_defs_from(data: &ValueMap) -> Option<Vec<PluginDef>> {
    for key in ["sink_defs", "sinks"] {
        let Some(Value::Array(arr)) = data.get(key) else { continue };
        if arr.is_empty() {
            continue;
        }
        let defs: Vec<PluginDef> = arr.iter().filter_map(|v| serde_json::from_value(v.clone()).ok()).collect();
        if !defs.is_empty() {
            return Some(defs);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: Vec<(&str, Value)>) -> ValueMap {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn prompt_fallback_fills_blank_fields_from_prompts_block() {
        let mut value = obj(vec![
            ("prompt_system", json!("")),
            ("prompts", json!({"system": "be terse", "user": "summarize {row}"})),
        ]);
        apply_prompt_fallback(&mut value);
        assert_eq!(value.get("prompt_system").and_then(Value::as_str), Some("be terse"));
        assert_eq!(value.get("prompt_template").and_then(Value::as_str), Some("summarize {row}"));
    }

    #[test]
    fn prompt_fallback_does_not_override_explicit_values() {
        let mut value = obj(vec![
            ("prompt_system", json!("keep me")),
            ("prompts", json!({"system": "ignored"})),
        ]);
        apply_prompt_fallback(&mut value);
        assert_eq!(value.get("prompt_system").and_then(Value::as_str), Some("keep me"));
    }

    #[test]
    fn halt_shorthand_normalizes_single_map_into_plugin_defs() {
        let mut value = obj(vec![("early_stop", json!({"name": "threshold", "metric": "error_rate", "threshold": 0.5}))]);
        normalize_halt_shorthand(&mut value);
        let defs = value.get("halt_condition_plugin_defs").and_then(Value::as_array).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["name"], json!("threshold"));
        assert_eq!(defs[0]["options"]["metric"], json!("error_rate"));
    }

    #[test]
    fn halt_shorthand_defaults_name_to_threshold() {
        let mut value = obj(vec![("halt_condition_config", json!({"metric": "cost", "threshold": 10}))]);
        normalize_halt_shorthand(&mut value);
        let defs = value.get("halt_condition_plugin_defs").and_then(Value::as_array).unwrap();
        assert_eq!(defs[0]["name"], json!("threshold"));
    }

    #[test]
    fn halt_shorthand_is_skipped_when_explicit_list_present() {
        let mut value = obj(vec![
            ("halt_condition_plugin_defs", json!([{"name": "threshold", "options": {}}])),
            ("early_stop", json!({"name": "ignored"})),
        ]);
        normalize_halt_shorthand(&mut value);
        let defs = value.get("halt_condition_plugin_defs").and_then(Value::as_array).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["name"], json!("threshold"));
    }

    #[test]
    fn sink_precedence_prefers_cycle_over_pack_over_defaults() {
        let defaults = obj(vec![("sink_defs", json!([{"name": "csv", "options": {}}]))]);
        let pack_data = obj(vec![("sink_defs", json!([{"name": "pack_sink", "options": {}}]))]);
        let cycle_data = obj(vec![("sink_defs", json!([{"name": "cycle_sink", "options": {}}]))]);

        let resolved = resolve_sink_defs(&defaults, Some(("pack", &pack_data)), &cycle_data).unwrap();
        assert_eq!(resolved[0].name, "cycle_sink");
    }

    #[test]
    fn sink_precedence_falls_back_to_pack_then_defaults() {
        let defaults = obj(vec![("sink_defs", json!([{"name": "csv", "options": {}}]))]);
        let pack_data = obj(vec![("sink_defs", json!([{"name": "pack_sink", "options": {}}]))]);
        let empty_cycle = ValueMap::new();

        let resolved = resolve_sink_defs(&defaults, Some(("pack", &pack_data)), &empty_cycle).unwrap();
        assert_eq!(resolved[0].name, "pack_sink");

        let resolved = resolve_sink_defs(&defaults, None, &empty_cycle).unwrap();
        assert_eq!(resolved[0].name, "csv");
    }

    #[test]
    fn sink_precedence_is_none_when_no_layer_declares_sinks() {
        let empty = ValueMap::new();
        assert!(resolve_sink_defs(&empty, None, &empty).is_none());
    }
}
