//! Construction seams the caller fills in for the two extension points
//! [`crate::build::build_runner`] cannot build itself: concrete sinks and
//! concrete LLM middlewares are external collaborators, exactly as
//! concrete LLM clients and datasources are — this crate only knows how
//! to turn a [`PluginDef`] into one via a caller-supplied builder.

use std::sync::Arc;

use cycleforge_artifacts::SinkBinding;
use cycleforge_core::model::PluginDef;
use cycleforge_core::traits::Middleware;

use crate::error::SuiteError;

/// Builds one [`SinkBinding`] from a `{name, options}` definition.
pub trait SinkPluginBuilder: Send + Sync {
    fn build(&self, def: &PluginDef, original_index: usize) -> Result<SinkBinding, SuiteError>;
}

/// Builds one middleware instance from a `{name, options}` definition.
/// Called at most once per distinct `(name, options)` pair per orchestrator
/// — see [`crate::middleware::MiddlewareCache`].
pub trait MiddlewareBuilder: Send + Sync {
    fn build(&self, def: &PluginDef) -> Result<Arc<dyn Middleware>, SuiteError>;
}
