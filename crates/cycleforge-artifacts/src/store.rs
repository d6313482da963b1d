//! Holds artifacts produced by sinks during one pipeline execution and
//! resolves downstream consume requests against them.

use std::collections::HashMap;

use cycleforge_core::model::{Artifact, ArtifactDescriptor, ArtifactRequest, RequestMode};
use cycleforge_core::security::SecurityLevel;

/// Artifacts produced so far, indexed by id, alias, and declared type.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    by_id: HashMap<String, Artifact>,
    by_alias: HashMap<String, Artifact>,
    by_type: HashMap<String, Vec<Artifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an artifact produced by `binding_id` against `descriptor`.
    /// An empty `artifact.id` is filled in as `"<binding_id>:<descriptor.name>"`.
    /// `SecurityLevel::Unofficial` on the artifact is treated as "unset" and
    /// backfilled from the descriptor, then the binding's own clearance --
    /// mirroring the original's falsy-value fallback chain now that the
    /// field is a non-optional enum rather than an optional string.
    pub fn register(&mut self, binding_id: &str, binding_security_level: Option<SecurityLevel>, descriptor: &ArtifactDescriptor, mut artifact: Artifact) {
        if artifact.id.is_empty() {
            artifact.id = format!("{binding_id}:{}", descriptor.name);
        }
        artifact.produced_by = binding_id.to_string();
        artifact.persist = artifact.persist || descriptor.persist;
        if artifact.schema_id.is_none() {
            artifact.schema_id = descriptor.schema_id.clone();
        }
        if artifact.security_level == SecurityLevel::Unofficial {
            artifact.security_level = descriptor.security_level.or(binding_security_level).unwrap_or(SecurityLevel::Unofficial);
        }

        let alias_key = descriptor.alias.clone().unwrap_or_else(|| descriptor.name.clone());
        self.by_alias.insert(alias_key, artifact.clone());
        self.by_type.entry(descriptor.type_.clone()).or_default().push(artifact.clone());
        self.by_id.insert(artifact.id.clone(), artifact);
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<&Artifact> {
        self.by_alias.get(alias)
    }

    pub fn get_by_type(&self, type_name: &str) -> Vec<Artifact> {
        self.by_type.get(type_name).cloned().unwrap_or_default()
    }

    /// Resolves each request's token against what's been produced so far.
    /// Alias tokens (`@name`) are keyed under both `@name` and the bare
    /// `name`, matching the original's "convenience alias without '@'" entry.
    pub fn resolve_requests(&self, requests: &[ArtifactRequest]) -> HashMap<String, Vec<Artifact>> {
        let mut resolved = HashMap::new();
        for request in requests {
            if request.token.is_empty() {
                continue;
            }
            let mut selected = if let Some(alias) = request.alias_name() {
                self.get_by_alias(alias).cloned().into_iter().collect::<Vec<_>>()
            } else {
                if ArtifactDescriptor::validate_type(&request.token).is_err() {
                    continue;
                }
                self.get_by_type(&request.token)
            };
            if request.mode == RequestMode::Single && selected.len() > 1 {
                selected.truncate(1);
            }
            if let Some(alias) = request.alias_name() {
                resolved.insert(alias.to_string(), selected.clone());
            }
            resolved.insert(request.token.clone(), selected);
        }
        resolved
    }

    pub fn items(&self) -> impl Iterator<Item = (&String, &Artifact)> {
        self.by_id.iter()
    }

    /// All artifacts produced so far, keyed by id -- passed to
    /// `ResultSink::finalize` after each binding executes.
    pub fn as_map(&self) -> &HashMap<String, Artifact> {
        &self.by_id
    }

    pub fn into_map(self) -> HashMap<String, Artifact> {
        self.by_id
    }
}
