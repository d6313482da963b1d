//! Middleware instance cache, shared across every cycle an orchestrator
//! builds in one run. Grounded on the original's `_create_middlewares`:
//! a middleware definition's cache key is `<name>:<stable-json(options)>`,
//! so two cycles that declare the identical middleware share one live
//! instance rather than constructing their own.

use std::collections::BTreeMap;
use std::sync::Arc;

use cycleforge_core::model::{PluginDef, ValueMap};
use cycleforge_core::traits::Middleware;
use serde_json::Value;

use crate::error::SuiteError;
use crate::plugins::MiddlewareBuilder;

pub struct MiddlewareCache {
    builder: Arc<dyn MiddlewareBuilder>,
    instances: std::collections::HashMap<String, Arc<dyn Middleware>>,
}

impl MiddlewareCache {
    pub fn new(builder: Arc<dyn MiddlewareBuilder>) -> Self {
        Self { builder, instances: std::collections::HashMap::new() }
    }

    /// Resolves each definition to a live instance, reusing a cached one
    /// when its `(name, options)` pair has already been built.
    pub fn resolve(&mut self, defs: &[PluginDef]) -> Result<Vec<Arc<dyn Middleware>>, SuiteError> {
        defs.iter().map(|def| self.get_or_build(def)).collect()
    }

    fn get_or_build(&mut self, def: &PluginDef) -> Result<Arc<dyn Middleware>, SuiteError> {
        let key = cache_key(def);
        if let Some(existing) = self.instances.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let instance = self.builder.build(def)?;
        self.instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }
}

fn cache_key(def: &PluginDef) -> String {
    let canonical = canonical_json(&Value::Object(def.options.clone()));
    format!("{}:{}", def.name, serde_json::to_string(&canonical).unwrap_or_default())
}

/// Recursively sorts object keys so two option maps built in different
/// insertion order still hash to the same cache key.
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.iter().map(|(k, v)| (k.clone(), canonical_json(v))).collect();
            let mut out = ValueMap::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// `true` iff `mw` is already (pointer-identically) present in `notified`.
pub fn already_notified(notified: &[Arc<dyn Middleware>], mw: &Arc<dyn Middleware>) -> bool {
    notified.iter().any(|n| Arc::ptr_eq(n, mw))
}
