//! Error kinds shared by multiple components. Component-specific error
//! enums (e.g. `cycleforge_config::ConfigError`) live in their own crates
//! and convert into these where they cross a component boundary.

use thiserror::Error;

/// Cross-cutting error kinds named in the error-handling design: fatal to a
/// run (configuration, permission, topology) rather than scoped to a row.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Missing required prompts, unknown plugin name, schema-validation
    /// failure, or a non-mapping option block. Always fatal, surfaced
    /// before a run starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A clearance violation, raised during dependency resolution or
    /// per-artifact handoff. Fatal to the pipeline.
    #[error("permission error: {0}")]
    Permission(String),

    /// A cycle in the sink DAG, an unresolved consume reference, or a
    /// duplicate binding id. Fatal to the pipeline.
    #[error("topology error: {0}")]
    Topology(String),
}
