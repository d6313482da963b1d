//! Built-in baseline-comparison plugins.

use cycleforge_core::model::ValueMap;
use cycleforge_core::traits::ComparisonPlugin;
use serde_json::json;

/// Diffs nothing. The default when a cycle declares no comparison plugins.
pub struct NoopComparisonPlugin;

impl ComparisonPlugin for NoopComparisonPlugin {
    fn name(&self) -> &str {
        "noop"
    }

    fn compare(&self, _baseline_payload: &ValueMap, _variant_payload: &ValueMap) -> ValueMap {
        ValueMap::new()
    }
}

/// Diffs the row count between a variant and its baseline.
pub struct RowCountComparisonPlugin {
    key: String,
}

impl RowCountComparisonPlugin {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for RowCountComparisonPlugin {
    fn default() -> Self {
        Self::new("row_delta")
    }
}

impl ComparisonPlugin for RowCountComparisonPlugin {
    fn name(&self) -> &str {
        "row_count"
    }

    fn compare(&self, baseline_payload: &ValueMap, variant_payload: &ValueMap) -> ValueMap {
        let base_count = result_count(baseline_payload);
        let variant_count = result_count(variant_payload);
        let mut diff = ValueMap::new();
        diff.insert(self.key.clone(), json!(variant_count - base_count));
        diff
    }
}

fn result_count(payload: &ValueMap) -> i64 {
    payload.get("results").and_then(|v| v.as_array()).map_or(0, |rows| rows.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_with_rows(n: usize) -> ValueMap {
        let mut payload = ValueMap::new();
        payload.insert("results".to_string(), json!(vec![json!({}); n]));
        payload
    }

    #[test]
    fn reports_row_count_delta() {
        let plugin = RowCountComparisonPlugin::default();
        let diff = plugin.compare(&payload_with_rows(10), &payload_with_rows(7));
        assert_eq!(diff.get("row_delta").unwrap(), &json!(-3));
    }
}
