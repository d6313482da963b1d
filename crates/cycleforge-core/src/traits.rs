//! External-interface traits. These are the contractual seams named in the
//! system overview: concrete LLM providers, concrete sinks, and concrete
//! datasources are out of scope here — only the traits they must implement.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::model::{
    Artifact, ArtifactDescriptor, Batch, CycleConfig, LlmRequest, LlmResponse, Record, ValueMap,
};
use crate::security::SecurityLevel;

/// Produces the tabular batch a cycle processes. Treated as a restartable,
/// finite sequence — never assumed to support random access.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self) -> Result<Batch, DataSourceError>;
}

/// Raised by a [`DataSource`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    #[error("failed to load batch: {0}")]
    Load(String),
}

/// A single LLM call, synchronous from the core's perspective but `async`
/// in this crate's trait because real clients are network-bound.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        metadata: &ValueMap,
    ) -> Result<LlmResponse, LlmClientError>;
}

/// Raised by an [`LlmClient`] implementation. Fed into the executor's retry
/// loop; on exhaustion it is wrapped with retry history and surfaced to the
/// row processor as a `Failure`.
#[derive(Debug, thiserror::Error)]
pub enum LlmClientError {
    #[error("{0}")]
    Generation(String),
}

/// A sink's required write plus its optional artifact-capability methods.
///
/// Capability probing happens once, at binding-construction time — the
/// pipeline calls `produces`/`consumes` exactly once per binding rather than
/// per execution, reifying the reflection-style `getattr` probe from the
/// original as ordinary (default, overridable) trait methods.
pub trait ResultSink: Send + Sync {
    fn write(&mut self, payload: &ValueMap, metadata: &ValueMap) -> Result<(), SinkError>;

    /// Additional artifact descriptors this sink declares beyond its static
    /// config. Called once, at binding construction.
    fn produces(&self) -> Vec<ArtifactDescriptor> {
        Vec::new()
    }

    /// Additional consume tokens this sink declares beyond its static
    /// config. Called once, at binding construction.
    fn consumes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Receives the resolved artifact handoff before `write`.
    fn prepare_artifacts(&mut self, _artifacts: &HashMap<String, Vec<Artifact>>) {}

    /// Returns artifacts produced by this sink's `write` call, keyed by
    /// descriptor name.
    fn collect_artifacts(&mut self) -> HashMap<String, Artifact> {
        HashMap::new()
    }

    /// Called once, after every binding has executed.
    fn finalize(&mut self, _all_artifacts: &HashMap<String, Artifact>, _metadata: &ValueMap) {}
}

/// Raised by a [`ResultSink`]. Each sink enforces its own `on_error`
/// policy (`abort`/`skip`); the core never overrides it.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("{0}")]
    Write(String),
}

/// A chain element wrapping each LLM call and receiving suite/cycle
/// lifecycle callbacks. All methods but `name` and `before_request` are
/// optional capability hooks with no-op defaults.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn before_request(&self, request: LlmRequest) -> LlmRequest {
        request
    }

    fn after_response(&self, _request: &LlmRequest, response: LlmResponse) -> LlmResponse {
        response
    }

    /// Isolated: a panicking/erroring implementation must not mask the
    /// original retry-exhaustion error. The executor calls this inside a
    /// `catch_unwind`-equivalent guard.
    fn on_retry_exhausted(&self, _request: &LlmRequest, _metadata: &ValueMap, _error: &str) {}

    fn on_suite_loaded(&self, _cycle_names: &[String], _preflight: &ValueMap) {}
    fn on_experiment_start(&self, _name: &str, _metadata: &ValueMap) {}
    fn on_experiment_complete(&self, _name: &str, _payload: &ValueMap, _metadata: &ValueMap) {}
    fn on_baseline_comparison(&self, _name: &str, _comparisons: &ValueMap) {}
    fn on_suite_complete(&self) {}
}

/// A stateful observer that may demand the cycle stop after any row.
pub trait HaltCondition: Send + Sync {
    fn name(&self) -> &str;
    fn reset(&mut self);
    /// Returns a non-empty reason map to signal halt; `None`/empty otherwise.
    fn check(&mut self, record: &Record, metadata: &ValueMap) -> Option<ValueMap>;
}

/// A per-row post-processor that augments a record's metrics.
pub trait TransformPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn transform(&self, row_and_responses: &ValueMap) -> ValueMap;
}

/// A post-cycle reducer over all successful records.
pub trait AggregationPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn aggregate(&self, records: &[Record]) -> ValueMap;
}

/// A reducer over `(baseline_payload, variant_payload)` yielding a diff map.
pub trait ComparisonPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn compare(&self, baseline_payload: &ValueMap, variant_payload: &ValueMap) -> ValueMap;
}

/// Preflight/suite-wide knowledge a [`Middleware`] may want before
/// `on_suite_loaded` fires. Not part of `spec.md`'s external-interface list
/// verbatim but required to type the callback's `preflight` argument.
#[derive(Debug, Clone, Default)]
pub struct Preflight {
    pub cycle_count: usize,
    pub baseline: Option<String>,
}

/// A resolved security clearance paired with the effective cycle config,
/// used by components that need both at once (e.g. the runner when
/// stamping `Record::security_level`).
#[derive(Debug, Clone)]
pub struct ResolvedCycle {
    pub config: CycleConfig,
    pub security_level: SecurityLevel,
}
