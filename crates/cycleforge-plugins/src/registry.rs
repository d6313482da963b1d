//! Explicit construction registry for transform, aggregation, comparison,
//! and halt-condition plugins, replacing the process-wide plugin
//! dictionaries of the original with registries built once per run, per
//! `spec.md` §9's dynamic-plugin-registry redesign note.

use std::sync::Arc;

use cycleforge_core::model::PluginDef;
use cycleforge_core::traits::{AggregationPlugin, ComparisonPlugin, HaltCondition, TransformPlugin};

use crate::aggregation::NoopAggregationPlugin;
use crate::comparison::{NoopComparisonPlugin, RowCountComparisonPlugin};
use crate::halt::ThresholdHaltCondition;
use crate::transform::NoopTransformPlugin;

/// Raised when a `PluginDef` names a plugin this registry doesn't
/// recognize, or supplies invalid options.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PluginConfigError(pub String);

pub fn create_transform_plugin(def: &PluginDef) -> Result<Arc<dyn TransformPlugin>, PluginConfigError> {
    match def.name.as_str() {
        "noop" => Ok(Arc::new(NoopTransformPlugin)),
        other => Err(PluginConfigError(format!("unknown transform plugin '{other}'"))),
    }
}

pub fn create_aggregation_plugin(def: &PluginDef) -> Result<Arc<dyn AggregationPlugin>, PluginConfigError> {
    match def.name.as_str() {
        "noop" => Ok(Arc::new(NoopAggregationPlugin)),
        other => Err(PluginConfigError(format!("unknown aggregation plugin '{other}'"))),
    }
}

pub fn create_comparison_plugin(def: &PluginDef) -> Result<Arc<dyn ComparisonPlugin>, PluginConfigError> {
    match def.name.as_str() {
        "noop" => Ok(Arc::new(NoopComparisonPlugin)),
        "row_count" => {
            let key = def.options.get("key").and_then(|v| v.as_str()).unwrap_or("row_delta");
            Ok(Arc::new(RowCountComparisonPlugin::new(key)))
        }
        other => Err(PluginConfigError(format!("unknown baseline comparison plugin '{other}'"))),
    }
}

pub fn create_halt_condition_plugin(def: &PluginDef) -> Result<Box<dyn HaltCondition>, PluginConfigError> {
    match def.name.as_str() {
        "threshold" => {
            let metric = def
                .options
                .get("metric")
                .and_then(|v| v.as_str())
                .ok_or_else(|| PluginConfigError("threshold plugin requires a 'metric' option".to_string()))?;
            let threshold = def
                .options
                .get("threshold")
                .and_then(value_as_f64)
                .ok_or_else(|| PluginConfigError("threshold plugin requires a numeric 'threshold' option".to_string()))?;
            let comparison = def.options.get("comparison").and_then(|v| v.as_str()).unwrap_or("gte");
            let min_rows = def.options.get("min_rows").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
            let label = def.options.get("label").and_then(|v| v.as_str()).map(str::to_string);
            Ok(Box::new(ThresholdHaltCondition::new(metric, threshold, comparison, min_rows, label)))
        }
        other => Err(PluginConfigError(format!("unknown halt condition plugin '{other}'"))),
    }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
