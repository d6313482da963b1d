//! Built-in halt-condition plugins.

use cycleforge_core::model::{Record, ValueMap};
use cycleforge_core::traits::HaltCondition;
use serde_json::{json, Value};

/// Comparison operator a [`ThresholdHaltCondition`] evaluates a metric
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gte,
    Gt,
    Lte,
    Lt,
}

impl Comparison {
    fn parse(raw: &str) -> Comparison {
        match raw.to_lowercase().as_str() {
            "gt" => Comparison::Gt,
            "lte" => Comparison::Lte,
            "lt" => Comparison::Lt,
            _ => Comparison::Gte,
        }
    }

    fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gte => value >= threshold,
            Comparison::Gt => value > threshold,
            Comparison::Lte => value <= threshold,
            Comparison::Lt => value < threshold,
        }
    }
}

/// Stops the cycle once a dotted metric path crosses a configured
/// threshold, after a minimum number of qualifying rows.
pub struct ThresholdHaltCondition {
    metric: String,
    threshold: f64,
    comparison: Comparison,
    min_rows: u32,
    label: Option<String>,
    rows_observed: u32,
    triggered_reason: Option<ValueMap>,
}

impl ThresholdHaltCondition {
    pub fn new(metric: impl Into<String>, threshold: f64, comparison: &str, min_rows: u32, label: Option<String>) -> Self {
        Self {
            metric: metric.into(),
            threshold,
            comparison: Comparison::parse(comparison),
            min_rows: min_rows.max(1),
            label,
            rows_observed: 0,
            triggered_reason: None,
        }
    }

    fn extract_metric<'a>(metrics: &'a ValueMap, path: &str) -> Option<&'a Value> {
        let mut current = metrics.get(path.split('.').next()?)?;
        for part in path.split('.').skip(1) {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

impl HaltCondition for ThresholdHaltCondition {
    fn name(&self) -> &str {
        "threshold"
    }

    fn reset(&mut self) {
        self.rows_observed = 0;
        self.triggered_reason = None;
    }

    fn check(&mut self, record: &Record, metadata: &ValueMap) -> Option<ValueMap> {
        if let Some(reason) = &self.triggered_reason {
            return Some(reason.clone());
        }

        let value = Self::extract_metric(&record.metrics, &self.metric)?.as_f64()?;

        self.rows_observed += 1;
        if self.rows_observed < self.min_rows {
            return None;
        }
        if !self.comparison.evaluate(value, self.threshold) {
            return None;
        }

        let mut reason = ValueMap::new();
        reason.insert("metric".to_string(), json!(self.metric));
        reason.insert("comparison".to_string(), json!(comparison_str(self.comparison)));
        reason.insert("threshold".to_string(), json!(self.threshold));
        reason.insert("value".to_string(), json!(value));
        reason.insert("rows_observed".to_string(), json!(self.rows_observed));
        if let Some(label) = &self.label {
            reason.insert("label".to_string(), json!(label));
        }
        for (key, value) in metadata {
            reason.entry(key.clone()).or_insert_with(|| value.clone());
        }

        self.triggered_reason = Some(reason.clone());
        Some(reason)
    }
}

fn comparison_str(comparison: Comparison) -> &'static str {
    match comparison {
        Comparison::Gte => "gte",
        Comparison::Gt => "gt",
        Comparison::Lte => "lte",
        Comparison::Lt => "lt",
    }
}
