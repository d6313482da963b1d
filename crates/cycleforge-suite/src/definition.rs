//! The raw, pre-merge suite definition a caller hands to an orchestrator:
//! a defaults layer, a set of named prompt packs, and an ordered list of
//! per-cycle overrides. Each cycle's effective [`cycleforge_core::model::CycleConfig`]
//! is only produced once [`crate::build::build_runner`] merges these layers.

use std::collections::HashMap;

use cycleforge_core::model::ValueMap;

/// One cycle's raw configuration overrides, prior to merging with its
/// prompt pack (if any) and the suite defaults.
#[derive(Debug, Clone)]
pub struct CycleSpec {
    pub name: String,
    pub prompt_pack: Option<String>,
    pub data: ValueMap,
}

impl CycleSpec {
    pub fn new(name: impl Into<String>, data: ValueMap) -> Self {
        Self { name: name.into(), prompt_pack: None, data }
    }
}

/// A suite: cycles sharing a data source and sink pool, plus the
/// defaults/prompt-pack layers [`crate::build::build_runner`] merges
/// underneath each cycle.
#[derive(Debug, Clone, Default)]
pub struct SuiteDefinition {
    pub defaults: ValueMap,
    pub prompt_packs: HashMap<String, ValueMap>,
    pub cycles: Vec<CycleSpec>,
}
