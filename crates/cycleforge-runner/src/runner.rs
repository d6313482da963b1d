//! Drives a single cycle end to end: prompt compilation, row dispatch
//! (sequential or bounded-parallel), early stopping, checkpointing, and
//! final payload assembly.

use std::sync::Arc;

use cycleforge_artifacts::{ArtifactPipeline, SinkBinding};
use cycleforge_core::model::{Batch, BacklogEntry, ConcurrencyConfig, CycleConfig, ValueMap};
use cycleforge_core::security::SecurityLevel;
use cycleforge_core::traits::{AggregationPlugin, HaltCondition, Middleware, TransformPlugin};
use cycleforge_llm::{CostTracker, LlmExecutor, LlmClient, RateLimiter};
use cycleforge_prompts::{CriterionDef, PromptCompiler, PromptEngine};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregator::{CyclePayload, ResultAggregator};
use crate::checkpoint::CheckpointManager;
use crate::error::RunnerError;
use crate::halt::EarlyStopCoordinator;
use crate::row_processor::RowProcessor;

/// Everything needed to run one cycle, already resolved from config into
/// live plugin instances by the caller.
#[allow(clippy::too_many_arguments)]
pub struct CycleRunner {
    config: CycleConfig,
    llm_client: Arc<dyn LlmClient>,
    llm_middlewares: Vec<Arc<dyn Middleware>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    cost_tracker: Option<Arc<dyn CostTracker>>,
    transform_plugins: Vec<Arc<dyn TransformPlugin>>,
    aggregation_plugins: Vec<Arc<dyn AggregationPlugin>>,
    halt_condition_plugins: Vec<Box<dyn HaltCondition>>,
    sinks: Vec<SinkBinding>,
    security_level: SecurityLevel,
}

impl CycleRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CycleConfig,
        llm_client: Arc<dyn LlmClient>,
        llm_middlewares: Vec<Arc<dyn Middleware>>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        cost_tracker: Option<Arc<dyn CostTracker>>,
        transform_plugins: Vec<Arc<dyn TransformPlugin>>,
        aggregation_plugins: Vec<Arc<dyn AggregationPlugin>>,
        halt_condition_plugins: Vec<Box<dyn HaltCondition>>,
        sinks: Vec<SinkBinding>,
        security_level: SecurityLevel,
    ) -> Self {
        Self {
            config,
            llm_client,
            llm_middlewares,
            rate_limiter,
            cost_tracker,
            transform_plugins,
            aggregation_plugins,
            halt_condition_plugins,
            sinks,
            security_level,
        }
    }

    pub async fn run(self, batch: Batch) -> Result<CyclePayload, RunnerError> {
        let CycleRunner {
            config,
            llm_client,
            llm_middlewares,
            rate_limiter,
            cost_tracker,
            transform_plugins,
            aggregation_plugins,
            halt_condition_plugins,
            sinks,
            security_level,
        } = self;

        let early_stop = Arc::new(EarlyStopCoordinator::new(halt_condition_plugins));

        let checkpoint = match &config.checkpoint {
            Some(cfg) => Some(Arc::new(CheckpointManager::new(cfg.path.clone(), cfg.field.clone())?)),
            None => None,
        };

        let mut engine = PromptEngine::new();
        let criteria_defs: Vec<CriterionDef> = config
            .criteria
            .iter()
            .map(|name| CriterionDef { name: Some(name.clone()), template: None, defaults: ValueMap::new() })
            .collect();
        let compiled = PromptCompiler::new(
            &mut engine,
            config.prompt_system.clone().unwrap_or_default(),
            config.prompt_template.clone().unwrap_or_default(),
            config.name.clone(),
            config.prompt_defaults.clone(),
            criteria_defs,
        )
        .compile()?;

        let executor = Arc::new(LlmExecutor::new(
            llm_client,
            llm_middlewares,
            config.retry.clone(),
            rate_limiter.clone(),
            cost_tracker.clone(),
            config.name.clone(),
        ));

        let processor = Arc::new(RowProcessor::new(
            Arc::new(engine),
            compiled.system,
            compiled.user,
            compiled.criteria,
            transform_plugins,
            config.criteria.clone(),
            executor,
            Some(security_level),
            config.name.clone(),
        ));

        let aggregator = Arc::new(Mutex::new(ResultAggregator::new(aggregation_plugins, cost_tracker)));

        let backlog = build_backlog(&batch, &config, checkpoint.as_deref());

        let should_parallel = should_run_parallel(&config.concurrency, backlog.len());
        if should_parallel {
            run_parallel(
                backlog,
                Arc::clone(&processor),
                Arc::clone(&aggregator),
                Arc::clone(&early_stop),
                checkpoint.clone(),
                rate_limiter,
                &config.concurrency,
            )
            .await;
        } else {
            run_sequential(backlog, &processor, &aggregator, &early_stop, checkpoint.as_deref()).await;
        }

        let early_stop_reason = early_stop.reason();
        let aggregator = unwrap_arc(aggregator, "aggregator").into_inner();
        let payload = aggregator.build_payload(Some(security_level), early_stop_reason);

        let payload_value = payload.to_value_map();
        let metadata_value = match serde_json::to_value(&payload.metadata) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => ValueMap::new(),
        };
        ArtifactPipeline::new(sinks)?.execute(&payload_value, &metadata_value)?;

        Ok(payload)
    }
}

/// Reclaims sole ownership of an `Arc` known to have no other live
/// references. True by construction here: every spawned task has already
/// completed by the time this is called.
fn unwrap_arc<T>(arc: Arc<T>, what: &str) -> T {
    Arc::try_unwrap(arc).unwrap_or_else(|_| panic!("{what} still has outstanding references"))
}

/// `true` iff parallel dispatch is both enabled and worth the overhead:
/// more than one worker configured, and the backlog clears the configured
/// threshold.
fn should_run_parallel(config: &ConcurrencyConfig, backlog_size: usize) -> bool {
    config.enabled && config.max_workers.max(1) > 1 && backlog_size >= config.backlog_threshold
}

fn build_backlog(batch: &Batch, config: &CycleConfig, checkpoint: Option<&CheckpointManager>) -> Vec<BacklogEntry> {
    let mut backlog = Vec::new();
    for (index, row) in batch.rows.iter().enumerate() {
        let context = cycleforge_core::model::RowContext::new(row.clone()).restricted_to(&config.prompt_fields);
        let row_id = checkpoint
            .and_then(|cp| row.get(cp.field()))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if let Some(cp) = checkpoint {
            if !row_id.is_empty() && cp.is_processed(&row_id) {
                continue;
            }
        }

        backlog.push(BacklogEntry { original_index: index, row_id, context });
    }
    backlog
}

async fn run_sequential(
    backlog: Vec<BacklogEntry>,
    processor: &RowProcessor,
    aggregator: &Mutex<ResultAggregator>,
    early_stop: &EarlyStopCoordinator,
    checkpoint: Option<&CheckpointManager>,
) {
    for entry in backlog {
        if early_stop.is_stopped() {
            break;
        }

        let row_id = (!entry.row_id.is_empty()).then_some(entry.row_id.as_str());
        let (record, failure) = processor.process_row(&entry.context, row_id).await;

        if let Some(record) = record {
            early_stop.check_record(&record, Some(entry.original_index));
            aggregator.lock().add_result(entry.original_index, record);
            if let (Some(cp), Some(id)) = (checkpoint, row_id) {
                let _ = cp.mark_processed(id);
            }
        } else if let Some(failure) = failure {
            aggregator.lock().add_failure(failure);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_parallel(
    backlog: Vec<BacklogEntry>,
    processor: Arc<RowProcessor>,
    aggregator: Arc<Mutex<ResultAggregator>>,
    early_stop: Arc<EarlyStopCoordinator>,
    checkpoint: Option<Arc<CheckpointManager>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    concurrency: &ConcurrencyConfig,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max_workers.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();

    for entry in backlog {
        if early_stop.is_stopped() {
            break;
        }

        if let Some(limiter) = &rate_limiter {
            while limiter.utilization() >= concurrency.utilization_pause {
                tokio::time::sleep(std::time::Duration::from_secs_f64(concurrency.pause_interval_secs.max(0.0))).await;
            }
        }

        let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore is never closed");
        let processor = Arc::clone(&processor);
        let aggregator = Arc::clone(&aggregator);
        let early_stop = Arc::clone(&early_stop);
        let checkpoint = checkpoint.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let row_id = (!entry.row_id.is_empty()).then_some(entry.row_id.clone());
            let (record, failure) = processor.process_row(&entry.context, row_id.as_deref()).await;

            if let Some(record) = record {
                early_stop.check_record(&record, Some(entry.original_index));
                aggregator.lock().add_result(entry.original_index, record);
                if let (Some(cp), Some(id)) = (&checkpoint, &row_id) {
                    let _ = cp.mark_processed(id);
                }
            } else if let Some(failure) = failure {
                aggregator.lock().add_failure(failure);
            }
        });
    }

    while tasks.join_next().await.is_some() {}
}
