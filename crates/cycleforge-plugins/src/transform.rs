//! Built-in transform plugins.

use cycleforge_core::model::ValueMap;
use cycleforge_core::traits::TransformPlugin;

/// Derives nothing. The default when a cycle declares no transform plugins.
pub struct NoopTransformPlugin;

impl TransformPlugin for NoopTransformPlugin {
    fn name(&self) -> &str {
        "noop"
    }

    fn transform(&self, _row_and_responses: &ValueMap) -> ValueMap {
        ValueMap::new()
    }
}
