//! Suite orchestrator (component C6): the shared build-runner algorithm
//! plus the standard and experimental (baseline-comparison) execution
//! strategies, each driving a [`cycleforge_runner::CycleRunner`] per cycle.

pub mod build;
pub mod definition;
pub mod error;
pub mod experimental;
pub mod middleware;
pub mod plugins;
pub mod standard;

pub use build::build_runner;
pub use definition::{CycleSpec, SuiteDefinition};
pub use error::SuiteError;
pub use experimental::ExperimentalOrchestrator;
pub use middleware::MiddlewareCache;
pub use plugins::{MiddlewareBuilder, SinkPluginBuilder};
pub use standard::{CycleOutcome, StandardOrchestrator};
