//! The standard strategy: runs every cycle in declared order, no baseline,
//! no comparisons. Grounded on `StandardOrchestrator.run` in the original.

use std::sync::Arc;

use cycleforge_core::model::{Batch, CycleConfig, PluginDef, ValueMap};
use cycleforge_core::traits::{LlmClient, Preflight};
use cycleforge_runner::CyclePayload;
use indexmap::IndexMap;
use serde_json::json;

use crate::build::build_runner;
use crate::definition::SuiteDefinition;
use crate::error::SuiteError;
use crate::middleware::{already_notified, MiddlewareCache};
use crate::plugins::{MiddlewareBuilder, SinkPluginBuilder};

/// One cycle's outcome as recorded by an orchestrator run.
pub struct CycleOutcome {
    pub payload: CyclePayload,
    pub config: CycleConfig,
    pub baseline_comparison: Option<ValueMap>,
}

pub struct StandardOrchestrator {
    llm_client: Arc<dyn LlmClient>,
    sink_builder: Arc<dyn SinkPluginBuilder>,
    middleware_builder: Arc<dyn MiddlewareBuilder>,
    default_sink_defs: Vec<PluginDef>,
}

impl StandardOrchestrator {
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
        let mut middlewares = MiddlewareCache::new(Arc::clone(&self.middleware_builder));
        let preflight = preflight.unwrap_or_else(|| Preflight { cycle_count: suite.cycles.len(), baseline: None });
        let preflight_value = preflight_value(&preflight, "cycle_count");
        let cycle_names: Vec<String> = suite.cycles.iter().map(|c| c.name.clone()).collect();

        let mut notified = Vec::new();
        let mut results = IndexMap::new();

        for cycle in &suite.cycles {
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

            for mw in &cycle_middlewares {
                if !already_notified(&notified, mw) {
                    mw.on_suite_loaded(&cycle_names, &preflight_value);
                    notified.push(Arc::clone(mw));
                }
                mw.on_experiment_start(&cycle.name, &config.metadata);
            }

            let payload = runner.run(batch.clone()).await?;

            for mw in &cycle_middlewares {
                mw.on_experiment_complete(&cycle.name, &payload.to_value_map(), &config.metadata);
            }

            results.insert(cycle.name.clone(), CycleOutcome { payload, config, baseline_comparison: None });
        }

        for mw in &notified {
            mw.on_suite_complete();
        }

        Ok(results)
    }
}

pub(crate) fn resolve_pack<'a>(
    suite: &'a SuiteDefinition,
    cycle: &'a crate::definition::CycleSpec,
) -> Option<(&'a str, &'a ValueMap)> {
    let pack_name = cycle
        .prompt_pack
        .as_deref()
        .or_else(|| suite.defaults.get("prompt_pack").and_then(|v| v.as_str()))?;
    suite.prompt_packs.get(pack_name).map(|data| (pack_name, data))
}

pub(crate) fn preflight_value(preflight: &Preflight, count_key: &str) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert(count_key.to_string(), json!(preflight.cycle_count));
    if let Some(baseline) = &preflight.baseline {
        map.insert("baseline".to_string(), json!(baseline));
    }
    map
}
