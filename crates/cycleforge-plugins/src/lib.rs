//! Built-in transform, aggregation, comparison, and halt-condition plugins,
//! plus the registry that turns a [`cycleforge_core::model::PluginDef`]
//! into a live instance.

pub mod aggregation;
pub mod comparison;
pub mod halt;
pub mod registry;
pub mod transform;

pub use aggregation::NoopAggregationPlugin;
pub use comparison::{NoopComparisonPlugin, RowCountComparisonPlugin};
pub use halt::ThresholdHaltCondition;
pub use registry::{
    create_aggregation_plugin, create_comparison_plugin, create_halt_condition_plugin, create_transform_plugin,
    PluginConfigError,
};
pub use transform::NoopTransformPlugin;
