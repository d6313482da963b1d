//! Collects per-row outcomes across a cycle and reduces them into the
//! payload handed to the artifact pipeline.

use std::sync::Arc;

use cycleforge_core::model::{Failure, Record, ValueMap};
use cycleforge_core::security::SecurityLevel;
use cycleforge_core::traits::AggregationPlugin;
use cycleforge_llm::CostTracker;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The counts a cycle's retry activity boils down to.
///
/// Invariant: `total_retries == sum(max(attempts - 1, 0))` over every
/// result and failure that carried retry info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySummary {
    pub total_requests: u64,
    pub total_retries: u64,
    pub exhausted: u64,
}

/// The bookkeeping fields every cycle payload carries alongside its rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetadata {
    pub rows: u64,
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stop: Option<ValueMap>,
}

/// The final reduction of a cycle: every successful record, every failure,
/// whatever the configured aggregation/cost plugins computed, and the
/// metadata block sinks key off of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyclePayload {
    pub results: Vec<Record>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<Failure>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub aggregates: IndexMap<String, ValueMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_summary: Option<RetrySummary>,
    #[serde(skip_serializing_if = "ValueMap::is_empty")]
    pub cost_summary: ValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stop: Option<ValueMap>,
    pub metadata: CycleMetadata,
}

impl CyclePayload {
    /// Bridges this typed payload to the dynamic `ValueMap` shape the
    /// artifact pipeline and sinks operate on.
    pub fn to_value_map(&self) -> ValueMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => ValueMap::new(),
        }
    }
}

/// Accumulates results and failures in submission order and reduces them
/// into a [`CyclePayload`] once a cycle finishes.
pub struct ResultAggregator {
    aggregation_plugins: Vec<Arc<dyn AggregationPlugin>>,
    cost_tracker: Option<Arc<dyn CostTracker>>,
    results: Vec<(usize, Record)>,
    failures: Vec<Failure>,
}

impl ResultAggregator {
    pub fn new(aggregation_plugins: Vec<Arc<dyn AggregationPlugin>>, cost_tracker: Option<Arc<dyn CostTracker>>) -> Self {
        Self { aggregation_plugins, cost_tracker, results: Vec::new(), failures: Vec::new() }
    }

    pub fn add_result(&mut self, original_index: usize, record: Record) {
        self.results.push((original_index, record));
    }

    pub fn add_failure(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    /// Reduces everything accumulated so far into the final payload. Rows
    /// are ordered by their original position in the source batch.
    pub fn build_payload(mut self, security_level: Option<SecurityLevel>, early_stop_reason: Option<ValueMap>) -> CyclePayload {
        self.results.sort_by_key(|(index, _)| *index);
        let results: Vec<Record> = self.results.into_iter().map(|(_, record)| record).collect();

        let mut aggregates = IndexMap::new();
        for plugin in &self.aggregation_plugins {
            let produced = plugin.aggregate(&results);
            if !produced.is_empty() {
                aggregates.insert(plugin.name().to_string(), produced);
            }
        }

        let retry_summary = build_retry_summary(&results, &self.failures);
        let cost_summary = self.cost_tracker.as_ref().map(|tracker| tracker.summary()).unwrap_or_default();

        let row_count = results.len() as u64;
        let failure_count = self.failures.len();

        let metadata = CycleMetadata {
            rows: row_count,
            row_count,
            failures: (failure_count > 0).then_some(failure_count as u64),
            security_level,
            early_stop: early_stop_reason.clone(),
        };

        CyclePayload {
            results,
            failures: self.failures,
            aggregates,
            retry_summary,
            cost_summary,
            early_stop: early_stop_reason,
            metadata,
        }
    }
}

fn build_retry_summary(results: &[Record], failures: &[Failure]) -> Option<RetrySummary> {
    let mut seen_any = false;
    let mut total_retries: u64 = 0;

    for record in results {
        if let Some(retry) = &record.retry {
            seen_any = true;
            total_retries += retry.retries();
        }
    }
    for failure in failures {
        if let Some(retry) = &failure.retry {
            seen_any = true;
            total_retries += retry.retries();
        }
    }

    if !seen_any {
        return None;
    }

    Some(RetrySummary {
        total_requests: (results.len() + failures.len()) as u64,
        total_retries,
        exhausted: failures.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycleforge_core::model::{LlmResponse, RetryInfo, RowContext};

    fn record_with_retry(index: usize, attempts: u32) -> (usize, Record) {
        let retry = RetryInfo { attempts, max_attempts: attempts.max(1), history: vec![] };
        let record = Record {
            row: RowContext::new(Default::default()),
            response: LlmResponse::default(),
            responses: Default::default(),
            metrics: ValueMap::new(),
            retry: Some(retry),
            security_level: None,
        };
        (index, record)
    }

    #[test]
    fn no_retry_info_anywhere_yields_no_summary() {
        let aggregator = ResultAggregator::new(vec![], None);
        let payload = aggregator.build_payload(None, None);
        assert!(payload.retry_summary.is_none());
    }

    #[test]
    fn retry_summary_sums_attempts_minus_one() {
        let mut aggregator = ResultAggregator::new(vec![], None);
        let (idx_a, record_a) = record_with_retry(1, 3);
        let (idx_b, record_b) = record_with_retry(0, 1);
        aggregator.add_result(idx_a, record_a);
        aggregator.add_result(idx_b, record_b);

        let payload = aggregator.build_payload(None, None);
        let summary = payload.retry_summary.unwrap();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_retries, 2);
        assert_eq!(summary.exhausted, 0);
        assert_eq!(payload.results[0].retry.as_ref().unwrap().attempts, 1);
        assert_eq!(payload.results[1].retry.as_ref().unwrap().attempts, 3);
    }
}
