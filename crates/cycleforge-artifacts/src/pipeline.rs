//! Resolves sink execution order from declared artifact dependencies and
//! runs each sink's write/collect/finalize lifecycle in that order.

use std::collections::{HashMap, HashSet, VecDeque};

use cycleforge_core::model::{ArtifactDescriptor, ArtifactRequest, SinkBindingMeta, ValueMap};
use cycleforge_core::security::SecurityLevel;
use cycleforge_core::traits::{ResultSink, SinkError};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::store::ArtifactStore;

/// Ties a sink instance to its declared metadata.
pub struct SinkBinding {
    pub meta: SinkBindingMeta,
    pub sink: Box<dyn ResultSink>,
}

impl SinkBinding {
    pub fn new(meta: SinkBindingMeta, sink: Box<dyn ResultSink>) -> Self {
        Self { meta, sink }
    }
}

/// Raised while building or executing an [`ArtifactPipeline`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("sink artifact dependencies contain a cycle or unresolved reference")]
    Cycle,
    #[error("sink '{consumer}' cannot depend on '{producer}' due to security level mismatch")]
    SecurityMismatch { consumer: String, producer: String },
    #[error("sink '{sink}' with clearance '{clearance}' cannot consume artifact '{artifact}' at level '{level}'")]
    ClearanceViolation { sink: String, clearance: SecurityLevel, artifact: String, level: SecurityLevel },
    #[error("invalid artifact type declared by sink '{sink}': {source}")]
    InvalidArtifactType {
        sink: String,
        #[source]
        source: cycleforge_core::model::InvalidArtifactType,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Resolves dependency order across a set of sink bindings and executes
/// them in that order, threading produced artifacts to later consumers.
pub struct ArtifactPipeline {
    ordered: Vec<SinkBinding>,
}

impl ArtifactPipeline {
    pub fn new(bindings: Vec<SinkBinding>) -> Result<Self, PipelineError> {
        let prepared = bindings.into_iter().map(prepare_binding).collect::<Result<Vec<_>, _>>()?;
        let ordered = resolve_order(prepared)?;
        Ok(Self { ordered })
    }

    pub fn execute(mut self, payload: &ValueMap, metadata: &ValueMap) -> Result<ArtifactStore, PipelineError> {
        let mut store = ArtifactStore::new();

        for binding in &mut self.ordered {
            let consumed = store.resolve_requests(&binding.meta.consumes);

            if let Some(clearance) = binding.meta.security_level {
                for artifacts in consumed.values() {
                    for artifact in artifacts {
                        if !SecurityLevel::is_allowed(artifact.security_level, clearance) {
                            return Err(PipelineError::ClearanceViolation {
                                sink: binding.meta.id.clone(),
                                clearance,
                                artifact: artifact.id.clone(),
                                level: artifact.security_level,
                            });
                        }
                    }
                }
            }

            binding.sink.prepare_artifacts(&consumed);
            binding.sink.write(payload, metadata)?;

            let produced = binding.sink.collect_artifacts();
            for descriptor in &binding.meta.produces {
                let candidate = produced
                    .get(&descriptor.name)
                    .or_else(|| descriptor.alias.as_ref().and_then(|alias| produced.get(alias)));
                if let Some(artifact) = candidate {
                    store.register(&binding.meta.id, binding.meta.security_level, descriptor, artifact.clone());
                }
            }

            binding.sink.finalize(store.as_map(), metadata);
        }

        Ok(store)
    }
}

/// Appends the sink's dynamically declared produces/consumes to the
/// statically configured ones and validates every produced type.
/// Also normalizes `security_level` to a default, so clearance checks
/// are always enforced rather than skipped for bindings that never
/// declared one.
fn prepare_binding(mut binding: SinkBinding) -> Result<SinkBinding, PipelineError> {
    binding.meta.security_level = Some(binding.meta.security_level.unwrap_or(SecurityLevel::Unofficial));

    for descriptor in binding.sink.produces() {
        ArtifactDescriptor::validate_type(&descriptor.type_)
            .map_err(|source| PipelineError::InvalidArtifactType { sink: binding.meta.id.clone(), source })?;
        binding.meta.produces.push(descriptor);
    }
    for existing in &binding.meta.produces {
        ArtifactDescriptor::validate_type(&existing.type_)
            .map_err(|source| PipelineError::InvalidArtifactType { sink: binding.meta.id.clone(), source })?;
    }
    for token in binding.sink.consumes() {
        binding.meta.consumes.push(ArtifactRequest::new(token, cycleforge_core::model::RequestMode::Single));
    }
    Ok(binding)
}

/// Kahn's algorithm over producer/consumer edges, with a cycle check done
/// upfront via `petgraph` and the ready queue re-sorted by
/// `original_index` on every pop -- the ready queue is deliberately
/// re-sorted each iteration rather than only seeded once, preserving the
/// original's visible tie-break behavior.
fn resolve_order(bindings: Vec<SinkBinding>) -> Result<Vec<SinkBinding>, PipelineError> {
    if bindings.is_empty() {
        return Ok(bindings);
    }

    let mut producers_by_name: HashMap<String, usize> = HashMap::new();
    let mut producers_by_type: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, binding) in bindings.iter().enumerate() {
        for descriptor in &binding.meta.produces {
            let key = descriptor.alias.clone().unwrap_or_else(|| descriptor.name.clone());
            producers_by_name.entry(key).or_insert(idx);
            producers_by_type.entry(descriptor.type_.clone()).or_default().push(idx);
        }
    }

    let mut dependencies: Vec<HashSet<usize>> = vec![HashSet::new(); bindings.len()];
    let mut dependents: Vec<HashSet<usize>> = vec![HashSet::new(); bindings.len()];

    for (idx, binding) in bindings.iter().enumerate() {
        for request in &binding.meta.consumes {
            if request.token.is_empty() {
                continue;
            }
            let matched: Vec<usize> = if let Some(alias) = request.alias_name() {
                match producers_by_name.get(alias) {
                    Some(&producer_idx) => {
                        enforce_dependency_security(&bindings[idx], &bindings[producer_idx])?;
                        vec![producer_idx]
                    }
                    None => Vec::new(),
                }
            } else if ArtifactDescriptor::validate_type(&request.token).is_ok() {
                let producer_ids = producers_by_type.get(&request.token).cloned().unwrap_or_default();
                for &producer_idx in &producer_ids {
                    enforce_dependency_security(&bindings[idx], &bindings[producer_idx])?;
                }
                producer_ids
            } else {
                Vec::new()
            };

            for producer_idx in matched {
                if producer_idx == idx {
                    continue;
                }
                dependencies[idx].insert(producer_idx);
                dependents[producer_idx].insert(idx);
            }
        }
    }

    if is_cyclic(&dependencies) {
        return Err(PipelineError::Cycle);
    }

    let mut ready: VecDeque<usize> =
        (0..bindings.len()).filter(|&idx| dependencies[idx].is_empty()).collect::<Vec<_>>().into();
    sort_ready(&mut ready, &bindings);

    let mut order: Vec<usize> = Vec::new();
    while let Some(current) = ready.pop_front() {
        order.push(current);
        for &dependent in &dependents[current] {
            dependencies[dependent].remove(&current);
            if dependencies[dependent].is_empty() {
                ready.push_back(dependent);
                sort_ready(&mut ready, &bindings);
            }
        }
    }

    if order.len() != bindings.len() {
        return Err(PipelineError::Cycle);
    }

    let mut slots: Vec<Option<SinkBinding>> = bindings.into_iter().map(Some).collect();
    Ok(order.into_iter().map(|idx| slots[idx].take().expect("each index visited once")).collect())
}

fn sort_ready(ready: &mut VecDeque<usize>, bindings: &[SinkBinding]) {
    let mut as_vec: Vec<usize> = ready.drain(..).collect();
    as_vec.sort_by_key(|&idx| bindings[idx].meta.original_index);
    ready.extend(as_vec);
}

fn enforce_dependency_security(consumer: &SinkBinding, producer: &SinkBinding) -> Result<(), PipelineError> {
    let Some(clearance) = consumer.meta.security_level else { return Ok(()) };
    let producer_level = producer.meta.security_level.unwrap_or(SecurityLevel::Unofficial);
    if !SecurityLevel::is_allowed(producer_level, clearance) {
        return Err(PipelineError::SecurityMismatch { consumer: consumer.meta.id.clone(), producer: producer.meta.id.clone() });
    }
    Ok(())
}

fn is_cyclic(dependencies: &[HashSet<usize>]) -> bool {
    let mut graph = DiGraph::<(), ()>::new();
    let nodes: Vec<_> = (0..dependencies.len()).map(|_| graph.add_node(())).collect();
    for (idx, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            graph.add_edge(nodes[dep], nodes[idx], ());
        }
    }
    is_cyclic_directed(&graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycleforge_core::model::{Artifact, RequestMode};
    use std::collections::HashMap as StdHashMap;

    struct RecordingSink {
        id: String,
        produced: Option<(String, Artifact)>,
        writes: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl ResultSink for RecordingSink {
        fn write(&mut self, _payload: &ValueMap, _metadata: &ValueMap) -> Result<(), SinkError> {
            self.writes.lock().unwrap().push(self.id.clone());
            Ok(())
        }

        fn collect_artifacts(&mut self) -> StdHashMap<String, Artifact> {
            let mut out = StdHashMap::new();
            if let Some((name, artifact)) = self.produced.take() {
                out.insert(name, artifact);
            }
            out
        }
    }

    fn meta(id: &str, idx: usize) -> SinkBindingMeta {
        SinkBindingMeta {
            id: id.to_string(),
            plugin: "recording".to_string(),
            artifact_config: ValueMap::new(),
            original_index: idx,
            produces: Vec::new(),
            consumes: Vec::new(),
            security_level: None,
        }
    }

    fn artifact(id: &str) -> Artifact {
        Artifact {
            id: id.to_string(),
            type_: "data/json".to_string(),
            path: None,
            payload: None,
            metadata: ValueMap::new(),
            schema_id: None,
            produced_by: String::new(),
            persist: false,
            security_level: SecurityLevel::Unofficial,
        }
    }

    #[test]
    fn orders_consumer_after_producer() {
        let writes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut producer_meta = meta("producer", 0);
        producer_meta.produces.push(ArtifactDescriptor {
            name: "rows".to_string(),
            type_: "data/json".to_string(),
            schema_id: None,
            persist: false,
            alias: None,
            security_level: None,
        });
        let producer = SinkBinding::new(
            producer_meta,
            Box::new(RecordingSink { id: "producer".to_string(), produced: Some(("rows".to_string(), artifact("a1"))), writes: writes.clone() }),
        );

        let mut consumer_meta = meta("consumer", 1);
        consumer_meta.consumes.push(ArtifactRequest::new("data/json", RequestMode::Single));
        let consumer =
            SinkBinding::new(consumer_meta, Box::new(RecordingSink { id: "consumer".to_string(), produced: None, writes: writes.clone() }));

        let pipeline = ArtifactPipeline::new(vec![consumer, producer]).unwrap();
        pipeline.execute(&ValueMap::new(), &ValueMap::new()).unwrap();

        assert_eq!(*writes.lock().unwrap(), vec!["producer".to_string(), "consumer".to_string()]);
    }

    #[test]
    fn detects_cycles() {
        let mut a_meta = meta("a", 0);
        a_meta.produces.push(ArtifactDescriptor { name: "x".to_string(), type_: "data/x".to_string(), schema_id: None, persist: false, alias: None, security_level: None });
        a_meta.consumes.push(ArtifactRequest::new("data/y", RequestMode::Single));
        let a = SinkBinding::new(a_meta, Box::new(RecordingSink { id: "a".to_string(), produced: None, writes: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())) }));

        let mut b_meta = meta("b", 1);
        b_meta.produces.push(ArtifactDescriptor { name: "y".to_string(), type_: "data/y".to_string(), schema_id: None, persist: false, alias: None, security_level: None });
        b_meta.consumes.push(ArtifactRequest::new("data/x", RequestMode::Single));
        let b = SinkBinding::new(b_meta, Box::new(RecordingSink { id: "b".to_string(), produced: None, writes: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())) }));

        let err = ArtifactPipeline::new(vec![a, b]).unwrap_err();
        assert!(matches!(err, PipelineError::Cycle));
    }

    #[test]
    fn unset_clearance_defaults_to_unofficial_and_blocks_elevated_artifacts() {
        let mut producer_meta = meta("producer", 0);
        producer_meta.security_level = Some(SecurityLevel::Secret);
        producer_meta.produces.push(ArtifactDescriptor {
            name: "rows".to_string(),
            type_: "data/json".to_string(),
            schema_id: None,
            persist: false,
            alias: None,
            security_level: Some(SecurityLevel::Secret),
        });
        let producer = SinkBinding::new(
            producer_meta,
            Box::new(RecordingSink {
                id: "producer".to_string(),
                produced: Some(("rows".to_string(), artifact("a1"))),
                writes: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            }),
        );

        let mut consumer_meta = meta("consumer", 1);
        assert_eq!(consumer_meta.security_level, None);
        consumer_meta.consumes.push(ArtifactRequest::new("data/json", RequestMode::Single));
        let consumer = SinkBinding::new(
            consumer_meta,
            Box::new(RecordingSink { id: "consumer".to_string(), produced: None, writes: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())) }),
        );

        let err = ArtifactPipeline::new(vec![consumer, producer]).unwrap_err();
        assert!(matches!(err, PipelineError::SecurityMismatch { .. }));
    }

    #[test]
    fn unset_clearance_allows_unofficial_artifacts() {
        let producer_meta = meta("producer", 0);
        let mut producer_meta = producer_meta;
        producer_meta.produces.push(ArtifactDescriptor {
            name: "rows".to_string(),
            type_: "data/json".to_string(),
            schema_id: None,
            persist: false,
            alias: None,
            security_level: None,
        });
        let producer = SinkBinding::new(
            producer_meta,
            Box::new(RecordingSink {
                id: "producer".to_string(),
                produced: Some(("rows".to_string(), artifact("a1"))),
                writes: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            }),
        );

        let mut consumer_meta = meta("consumer", 1);
        consumer_meta.consumes.push(ArtifactRequest::new("data/json", RequestMode::Single));
        let consumer = SinkBinding::new(
            consumer_meta,
            Box::new(RecordingSink { id: "consumer".to_string(), produced: None, writes: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())) }),
        );

        let pipeline = ArtifactPipeline::new(vec![consumer, producer]).unwrap();
        assert!(pipeline.execute(&ValueMap::new(), &ValueMap::new()).is_ok());
    }
}
