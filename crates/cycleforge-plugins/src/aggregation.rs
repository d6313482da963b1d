//! Built-in aggregation plugins.

use cycleforge_core::model::{Record, ValueMap};
use cycleforge_core::traits::AggregationPlugin;

/// Produces no aggregate. The default when a cycle declares no aggregation
/// plugins.
pub struct NoopAggregationPlugin;

impl AggregationPlugin for NoopAggregationPlugin {
    fn name(&self) -> &str {
        "noop"
    }

    fn aggregate(&self, _records: &[Record]) -> ValueMap {
        ValueMap::new()
    }
}
