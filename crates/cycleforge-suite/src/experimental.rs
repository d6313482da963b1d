//! The experimental strategy: runs the baseline cycle first, then every
//! variant, diffing each variant's payload against the baseline with the
//! configured comparison plugins. Grounded on `ExperimentalOrchestrator.run`
//! / `_compare_with_baseline` in the original.

use std::sync::Arc;

use cycleforge_core::model::{Batch, PluginDef, ValueMap};
use cycleforge_core::traits::{LlmClient, Preflight};
use cycleforge_plugins::create_comparison_plugin;
use indexmap::IndexMap;
use serde_json::Value;

use crate::build::build_runner;
use crate::definition::{CycleSpec, SuiteDefinition};
use crate::error::SuiteError;
use crate::middleware::{already_notified, MiddlewareCache};
use crate::plugins::{MiddlewareBuilder, SinkPluginBuilder};
use crate::standard::{preflight_value, resolve_pack, CycleOutcome};

pub struct ExperimentalOrchestrator {
    llm_client: Arc<dyn LlmClient>,
    sink_builder: Arc<dyn SinkPluginBuilder>,
    middleware_builder: Arc<dyn MiddlewareBuilder>,
    default_sink_defs: Vec<PluginDef>,
}

impl ExperimentalOrchestrator {
    pub fn new(
        llm_client: Arc<dyn LlmClient>,
        sink_builder: Arc<dyn SinkPluginBuilder>,
        middleware_builder: Arc<dyn MiddlewareBuilder>,
        default_sink_defs: Vec<PluginDef>,
    ) -> Self {
        Self { llm_client, sink_builder, middleware_builder, default_sink_defs }
    }

    pub async fn run(
        &self,
        suite: &SuiteDefinition,
        batch: &Batch,
        preflight: Option<Preflight>,
    ) -> Result<IndexMap<String, CycleOutcome>, SuiteError> {
        let Some(baseline_idx) = identify_baseline(suite) else { return Ok(IndexMap::new()) };
        let baseline_name = suite.cycles[baseline_idx].name.clone();

        let mut order: Vec<&CycleSpec> = vec![&suite.cycles[baseline_idx]];
        order.extend(suite.cycles.iter().enumerate().filter(|(i, _)| *i != baseline_idx).map(|(_, c)| c));

        let mut middlewares = MiddlewareCache::new(Arc::clone(&self.middleware_builder));
        let preflight = preflight.unwrap_or_else(|| Preflight {
            cycle_count: suite.cycles.len(),
            baseline: Some(baseline_name.clone()),
        });
        let preflight_value = preflight_value(&preflight, "experiment_count");
        let experiment_names: Vec<String> = suite.cycles.iter().map(|c| c.name.clone()).collect();

        let mut notified = Vec::new();
        let mut results = IndexMap::new();
        let mut baseline_payload = None;

        for cycle in order {
            let pack = resolve_pack(suite, cycle);
            let (runner, config, cycle_middlewares) = build_runner(
                &suite.defaults,
                pack,
                &cycle.name,
                &cycle.data,
                Arc::clone(&self.llm_client),
                &mut middlewares,
                self.sink_builder.as_ref(),
                &self.default_sink_defs,
            )?;

            let is_baseline = cycle.name == baseline_name;

            for mw in &cycle_middlewares {
                if !already_notified(&notified, mw) {
                    mw.on_suite_loaded(&experiment_names, &preflight_value);
                    notified.push(Arc::clone(mw));
                }
                mw.on_experiment_start(&cycle.name, &config.metadata);
            }

            let payload = runner.run(batch.clone()).await?;

            for mw in &cycle_middlewares {
                mw.on_experiment_complete(&cycle.name, &payload.to_value_map(), &config.metadata);
            }

            if is_baseline {
                baseline_payload = Some(payload.clone());
            }

            let mut baseline_comparison = None;
            if !is_baseline {
                if let Some(base_payload) = &baseline_payload {
                    let comparisons = compare_with_baseline(&suite.defaults, pack, cycle, base_payload.to_value_map(), payload.to_value_map())?;
                    if !comparisons.is_empty() {
                        for mw in &cycle_middlewares {
                            mw.on_baseline_comparison(&cycle.name, &comparisons);
                        }
                        baseline_comparison = Some(comparisons);
                    }
                }
            }

            results.insert(cycle.name.clone(), CycleOutcome { payload, config, baseline_comparison });
        }

        for mw in &notified {
            mw.on_suite_complete();
        }

        Ok(results)
    }
}

/// The first cycle whose raw (pre-merge) metadata carries a truthy
/// `is_baseline`, else the first cycle in declared order.
fn identify_baseline(suite: &SuiteDefinition) -> Option<usize> {
    suite.cycles.iter().position(is_baseline_cycle).or(if suite.cycles.is_empty() { None } else { Some(0) })
}

fn is_baseline_cycle(cycle: &CycleSpec) -> bool {
    cycle.data.get("metadata").and_then(|m| m.get("is_baseline")).map(is_truthy).unwrap_or(false)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Gathers comparison plugin defs in precedence order `defaults → pack →
/// cycle metadata` (per this implementation's Open Question resolution;
/// the original concatenates `pack + defaults` then appends metadata) and
/// runs each against `(baseline_payload, variant_payload)`, returning the
/// non-empty diffs keyed by plugin name.
fn compare_with_baseline(
    defaults: &ValueMap,
    pack: Option<(&str, &ValueMap)>,
    cycle: &CycleSpec,
    baseline_payload: ValueMap,
    variant_payload: ValueMap,
) -> Result<ValueMap, SuiteError> {
    let mut defs = plugin_defs_from(defaults, "baseline_plugin_defs");
    if let Some((_, pack_data)) = pack {
        defs.extend(plugin_defs_from(pack_data, "baseline_plugins"));
    }
    if let Some(Value::Object(meta)) = cycle.data.get("metadata") {
        defs.extend(plugin_defs_from(meta, "baseline_plugins"));
    }

    let mut comparisons = ValueMap::new();
    for def in &defs {
        let plugin = create_comparison_plugin(def)?;
        let diff = plugin.compare(&baseline_payload, &variant_payload);
        if !diff.is_empty() {
            comparisons.insert(plugin.name().to_string(), Value::Object(diff));
        }
    }
    Ok(comparisons)
}

fn plugin_defs_from(data: &ValueMap, key: &str) -> Vec<PluginDef> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| serde_json::from_value(v.clone()).ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cycle(name: &str, data: ValueMap) -> CycleSpec {
        CycleSpec::new(name, data)
    }

    #[test]
    fn is_truthy_matches_python_style_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([1])));
    }

    #[test]
    fn identify_baseline_picks_first_truthy_is_baseline() {
        let suite = SuiteDefinition {
            defaults: ValueMap::new(),
            prompt_packs: Default::default(),
            cycles: vec![
                cycle("control", ValueMap::new()),
                cycle("variant", [("metadata".to_string(), json!({"is_baseline": true}))].into_iter().collect()),
            ],
        };
        assert_eq!(identify_baseline(&suite), Some(1));
    }

    #[test]
    fn identify_baseline_falls_back_to_first_cycle() {
        let suite = SuiteDefinition {
            defaults: ValueMap::new(),
            prompt_packs: Default::default(),
            cycles: vec![cycle("control", ValueMap::new()), cycle("variant", ValueMap::new())],
        };
        assert_eq!(identify_baseline(&suite), Some(0));
    }

    #[test]
    fn identify_baseline_is_none_for_empty_suite() {
        let suite = SuiteDefinition { defaults: ValueMap::new(), prompt_packs: Default::default(), cycles: vec![] };
        assert_eq!(identify_baseline(&suite), None);
    }

    struct StubLlm;

    #[async_trait::async_trait]
    impl cycleforge_core::traits::LlmClient for StubLlm {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _metadata: &ValueMap,
        ) -> Result<cycleforge_core::model::LlmResponse, cycleforge_core::traits::LlmClientError> {
            Ok(cycleforge_core::model::LlmResponse { content: Some("ok".to_string()), ..Default::default() })
        }
    }

    struct NoSinks;

    impl SinkPluginBuilder for NoSinks {
        fn build(&self, _def: &PluginDef, _original_index: usize) -> Result<cycleforge_artifacts::SinkBinding, SuiteError> {
            unreachable!("this suite declares no sinks")
        }
    }

    struct RecordingMiddleware {
        name: String,
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl cycleforge_core::traits::Middleware for RecordingMiddleware {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_baseline_comparison(&self, name: &str, _comparisons: &ValueMap) {
            self.calls.lock().unwrap().push(name.to_string());
        }
    }

    struct RecordingMiddlewareBuilder {
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl MiddlewareBuilder for RecordingMiddlewareBuilder {
        fn build(&self, def: &PluginDef) -> Result<Arc<dyn cycleforge_core::traits::Middleware>, SuiteError> {
            Ok(Arc::new(RecordingMiddleware { name: def.name.clone(), calls: Arc::clone(&self.calls) }))
        }
    }

    #[tokio::test]
    async fn baseline_runs_first_and_every_variant_is_diffed_against_it() {
        let mut defaults = ValueMap::new();
        defaults.insert("prompt_system".to_string(), json!("You are helpful"));
        defaults.insert("prompt_template".to_string(), json!("Say hi to {name}"));
        defaults.insert("baseline_plugin_defs".to_string(), json!([{"name": "row_count", "options": {}}]));
        defaults.insert("llm_middleware_defs".to_string(), json!([{"name": "recorder", "options": {}}]));

        let mut variant_data = ValueMap::new();
        variant_data.insert("metadata".to_string(), json!({}));
        let mut control_data = ValueMap::new();
        control_data.insert("metadata".to_string(), json!({"is_baseline": true}));

        let suite = SuiteDefinition {
            defaults,
            prompt_packs: Default::default(),
            cycles: vec![cycle("control", control_data), cycle("variant", variant_data)],
        };

        let batch = Batch { rows: vec![[("name".to_string(), json!("Ada"))].into_iter().collect()], attributes: ValueMap::new() };

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let orchestrator = ExperimentalOrchestrator::new(
            Arc::new(StubLlm),
            Arc::new(NoSinks),
            Arc::new(RecordingMiddlewareBuilder { calls: Arc::clone(&calls) }),
            vec![],
        );

        let results = orchestrator.run(&suite, &batch, None).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results["control"].baseline_comparison.is_none());
        let variant_comparison = results["variant"].baseline_comparison.as_ref().unwrap();
        assert_eq!(variant_comparison["row_count"]["row_delta"], json!(0));

        assert_eq!(calls.lock().unwrap().as_slice(), ["variant"]);
    }

    #[test]
    fn plugin_defs_gathered_in_defaults_pack_metadata_order() {
        let defaults = [("baseline_plugin_defs".to_string(), json!([{"name": "row_count", "options": {}}]))]
            .into_iter()
            .collect::<ValueMap>();
        let pack_data = [("baseline_plugins".to_string(), json!([{"name": "pack_plugin", "options": {}}]))]
            .into_iter()
            .collect::<ValueMap>();
        let metadata = [("baseline_plugins".to_string(), json!([{"name": "cycle_plugin", "options": {}}]))]
            .into_iter()
            .collect::<ValueMap>();

        let mut defs = plugin_defs_from(&defaults, "baseline_plugin_defs");
        defs.extend(plugin_defs_from(&pack_data, "baseline_plugins"));
        defs.extend(plugin_defs_from(&metadata, "baseline_plugins"));

        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["row_count", "pack_plugin", "cycle_plugin"]);
    }
}
