//! Coordinates early stopping across a set of [`HaltCondition`] plugins.

use std::sync::atomic::{AtomicBool, Ordering};

use cycleforge_core::model::{Record, ValueMap};
use cycleforge_core::traits::HaltCondition;
use parking_lot::Mutex;
use serde_json::json;

/// Checks each processed record against every configured halt condition and
/// latches the first reason that fires. Cheap to call when no plugins are
/// configured: `is_stopped`/`check_record` become no-ops.
pub struct EarlyStopCoordinator {
    plugins: Mutex<Vec<Box<dyn HaltCondition>>>,
    active: bool,
    stopped: AtomicBool,
    reason: Mutex<Option<ValueMap>>,
}

impl EarlyStopCoordinator {
    pub fn new(mut plugins: Vec<Box<dyn HaltCondition>>) -> Self {
        let active = !plugins.is_empty();
        for plugin in &mut plugins {
            plugin.reset();
        }
        Self { plugins: Mutex::new(plugins), active, stopped: AtomicBool::new(false), reason: Mutex::new(None) }
    }

    pub fn is_stopped(&self) -> bool {
        self.active && self.stopped.load(Ordering::SeqCst)
    }

    /// Evaluates every plugin against `record` in order, latching on the
    /// first non-empty reason. A plugin that panics is logged and skipped
    /// rather than poisoning the whole coordinator.
    pub fn check_record(&self, record: &Record, row_index: Option<usize>) {
        if !self.active || self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut reason_guard = self.reason.lock();
        if reason_guard.is_some() {
            return;
        }

        let mut plugins = self.plugins.lock();
        for plugin in plugins.iter_mut() {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| plugin.check(record, &ValueMap::new())));

            let reason = match outcome {
                Ok(reason) => reason,
                Err(_) => {
                    tracing::warn!("halt-condition plugin panicked; continuing");
                    continue;
                }
            };

            let Some(mut reason) = reason else { continue };
            reason.entry("plugin".to_string()).or_insert_with(|| json!(plugin.name()));
            if let Some(idx) = row_index {
                reason.entry("row_index".to_string()).or_insert_with(|| json!(idx));
            }

            tracing::info!(plugin = plugin.name(), "early stop triggered");
            *reason_guard = Some(reason);
            self.stopped.store(true, Ordering::SeqCst);
            break;
        }
    }

    pub fn reason(&self) -> Option<ValueMap> {
        self.reason.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ThresholdStub {
        calls: std::sync::atomic::AtomicU32,
    }

    impl HaltCondition for ThresholdStub {
        fn name(&self) -> &str {
            "stub"
        }

        fn reset(&mut self) {}

        fn check(&mut self, _record: &Record, _metadata: &ValueMap) -> Option<ValueMap> {
            let seen = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if seen >= 1 {
                let mut reason = ValueMap::new();
                reason.insert("triggered_by".to_string(), json!("stub"));
                Some(reason)
            } else {
                None
            }
        }
    }

    fn dummy_record() -> Record {
        Record {
            row: cycleforge_core::model::RowContext::new(Default::default()),
            response: Default::default(),
            responses: Default::default(),
            metrics: ValueMap::new(),
            retry: None,
            security_level: None,
        }
    }

    #[test]
    fn latches_first_reason_and_ignores_further_checks() {
        let coordinator = EarlyStopCoordinator::new(vec![Box::new(ThresholdStub { calls: std::sync::atomic::AtomicU32::new(0) })]);
        assert!(!coordinator.is_stopped());
        coordinator.check_record(&dummy_record(), Some(0));
        assert!(!coordinator.is_stopped());
        coordinator.check_record(&dummy_record(), Some(1));
        assert!(coordinator.is_stopped());
        let reason = coordinator.reason().unwrap();
        assert_eq!(reason.get("plugin").unwrap(), "stub");
        assert_eq!(reason.get("row_index").unwrap(), &json!(1));
    }

    #[test]
    fn no_plugins_never_stops() {
        let coordinator = EarlyStopCoordinator::new(vec![]);
        coordinator.check_record(&dummy_record(), None);
        assert!(!coordinator.is_stopped());
        assert!(coordinator.reason().is_none());
    }
}
