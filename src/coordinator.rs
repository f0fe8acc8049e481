//! Parallel Training Coordinator (spec §4.9).
//!
//! Turns a `RunSpec` into independent per-time-slice batches, runs them
//! over a fixed-size worker pool behind a bounded work queue, and keeps
//! the run progressing through failures with pressure-driven pause/resume
//! for backpressure. Checkpoint-driven resume is built on
//! `store::checkpoint`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{classify, strategy_for, RecoveryStrategy};
use crate::error::{PulseError, Result};
use crate::metrics_collector::MetricsCollector;
use crate::process::{CancelToken, CostController, ProcessRegistry, RunHandle};
use crate::retrodiction::{BatchResult, BatchStatus, RetrodictionBatch, RetrodictionWorker, TransitionModel};
use crate::store::Store;
use crate::trust::TrustTracker;
use crate::trust_buffer::TrustUpdateBuffer;
use crate::types::{Checkpoint, ItemMetadata, MetricEvent, RunId, RunSpec};

/// Supplies the concrete inputs a batch needs to run: the `RetrodictionBatch`
/// itself (observed values, fired rules, baseline ref) and an a-priori cost
/// estimate consulted before dispatch. The repository backing this lives in
/// host-system code (spec §6); the coordinator only knows the trait.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn load_batch(
        &self,
        run: &RunSpec,
        batch_index: u64,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<RetrodictionBatch>;

    /// Projected `compute_units` this batch will cost, consulted by the
    /// Cost Controller before dispatch (spec §4.9 "Cost and admission").
    async fn estimated_compute_units(&self, run: &RunSpec, batch_index: u64) -> Result<f64>;
}

/// Backpressure thresholds against the signals the Metrics Collector and
/// Trust Update Buffer expose (spec §4.9 "Backpressure").
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    /// Pressure at/above which dispatch of new batches pauses.
    pub high_water_mark: f64,
    /// Pressure at/below which dispatch resumes.
    pub low_water_mark: f64,
    /// How long to wait between pressure re-checks while paused.
    pub poll_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { high_water_mark: 0.8, low_water_mark: 0.5, poll_interval: Duration::from_millis(20) }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub backpressure: BackpressureConfig,
    /// A reconstructed run whose latest checkpoint is older than this is
    /// surfaced as `Orphaned` rather than silently resumed (spec §4.11).
    pub max_checkpoint_age: chrono::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { backpressure: BackpressureConfig::default(), max_checkpoint_age: chrono::Duration::hours(1) }
    }
}

/// Outcome of one run, returned once dispatch stops (clean finish,
/// cancellation, or a budget pause).
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: RunId,
    pub batches_completed: u64,
    pub batches_failed: u64,
    /// Set if the run stopped short of `end_time` because of a budget
    /// pause; `false` for a clean finish or a cancellation.
    pub paused: bool,
    pub cancelled: bool,
}

/// Splits `run.start_time..run.end_time` into `batch_size`-wide, ordered,
/// half-open windows.
fn batch_windows(run: &RunSpec) -> Vec<(u64, DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    let mut start = run.start_time;
    let mut index = 0u64;
    while start < run.end_time {
        let end = (start + run.batch_size).min(run.end_time);
        windows.push((index, start, end));
        start = end;
        index += 1;
    }
    windows
}

fn backoff_with_jitter(attempt: u32, retry_policy: &crate::types::RetryPolicy) -> Duration {
    let exp = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let base = retry_policy.base_backoff_ms.saturating_mul(exp).min(retry_policy.max_backoff_ms);
    let jitter = rand::thread_rng().gen_range(0..=(base / 4).max(1));
    Duration::from_millis(base + jitter)
}

/// Turns `RunSpec`s into batches, schedules workers, and keeps a run
/// progressing through failures (spec §4.9).
pub struct Coordinator {
    store: Arc<Store>,
    registry: Arc<ProcessRegistry>,
    cost_controller: Arc<CostController>,
    trust_buffer: Arc<TrustUpdateBuffer>,
    trust_tracker: Arc<TrustTracker>,
    metrics_collector: Arc<MetricsCollector>,
    worker: Arc<RetrodictionWorker>,
    config: CoordinatorConfig,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ProcessRegistry>,
        cost_controller: Arc<CostController>,
        trust_buffer: Arc<TrustUpdateBuffer>,
        trust_tracker: Arc<TrustTracker>,
        metrics_collector: Arc<MetricsCollector>,
        worker: Arc<RetrodictionWorker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self { store, registry, cost_controller, trust_buffer, trust_tracker, metrics_collector, worker, config }
    }

    /// Hydrate the trust tracker from a run's latest checkpoint. Call this
    /// once at process startup, before `run`, for a run that may have been
    /// interrupted mid-flight (spec §8 scenario 2 "crash-and-resume").
    pub async fn restore_trust_snapshot(&self, run_id: &str) -> Result<()> {
        let Some(checkpoint) = self.store.latest_checkpoint(run_id).await? else {
            return Ok(());
        };
        let item = self.store.get_item(&checkpoint.trust_snapshot_id).await?;
        self.trust_tracker.restore(&item.payload)?;
        Ok(())
    }

    async fn checkpoint_after_batch(&self, run: &RunSpec, batch_index: u64) -> Result<()> {
        // Flush so the snapshot reflects this batch's trust updates, not a
        // stale buffered state (spec §9 "checkpointing unified as an item
        // type; the only writer is the Coordinator").
        self.trust_buffer.flush()?;
        let snapshot = self.trust_tracker.snapshot()?;
        let mut canonical_fields = std::collections::HashMap::new();
        canonical_fields.insert("run_id".to_string(), run.run_id.clone());
        canonical_fields.insert("batch_index".to_string(), batch_index.to_string());
        let metadata = ItemMetadata { canonical_fields, extra: std::collections::HashMap::new() };
        let trust_snapshot_id = self.store.put_item("__trust_snapshots", "coordinator", snapshot, metadata).await?;
        let checkpoint = Checkpoint {
            run_id: run.run_id.clone(),
            batch_index,
            store_versions_consumed: std::collections::HashMap::new(),
            trust_snapshot_id,
            metrics_watermark: Utc::now(),
            at: Utc::now(),
        };
        self.store.put_checkpoint(&checkpoint).await?;
        Ok(())
    }

    async fn emit_metric(&self, run_id: &str, name: &str, value: f64) {
        let event = MetricEvent {
            metric_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            name: name.to_string(),
            value,
            tags: std::collections::HashMap::new(),
            at: Utc::now(),
        };
        if let Err(e) = self.metrics_collector.submit(event).await {
            warn!(run_id, error = %e, "failed to submit coordinator metric");
        }
    }

    /// Current backpressure reading: the worse of the metrics collector's
    /// queue pressure and the trust buffer's pending pressure (spec §4.9:
    /// "the metrics collector *or* trust buffer report sustained pressure").
    fn pressure(&self) -> f64 {
        self.metrics_collector.queue_pressure().max(self.trust_buffer.pending_pressure())
    }

    /// Run one batch to completion, retrying retriable failures up to
    /// `run.retry_policy.max_attempts` with exponential backoff and
    /// jitter. Non-retriable failures (including the worker's own
    /// `BatchStatus::Failed` results) surface as-is; the caller decides
    /// whether the run continues.
    async fn run_one_batch(
        worker: &RetrodictionWorker,
        source: &dyn BatchSource,
        model: Arc<dyn TransitionModel>,
        run: &RunSpec,
        batch_index: u64,
        window: (DateTime<Utc>, DateTime<Utc>),
        cancel: &CancelToken,
    ) -> Result<BatchResult> {
        let retry_policy = &run.retry_policy;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(retry_policy.total_deadline_ms);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let batch = source.load_batch(run, batch_index, window).await?;
            match worker.execute_batch(batch, model.clone(), cancel).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let strategy = strategy_for(classify(&e));
                    let can_retry = matches!(strategy, RecoveryStrategy::RetryWithBackoff)
                        && attempt < retry_policy.max_attempts
                        && tokio::time::Instant::now() < deadline;
                    if !can_retry {
                        return Err(e);
                    }
                    let delay = backoff_with_jitter(attempt, retry_policy);
                    warn!(run_id = %run.run_id, batch_index, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying batch");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Execute `run` end to end: split into batches, resume past any
    /// already-checkpointed prefix, dispatch across `run.concurrency`
    /// workers subject to backpressure and cost admission, and checkpoint
    /// after each contiguous run of completions.
    pub async fn run(&self, run: RunSpec, source: Arc<dyn BatchSource>, model: Arc<dyn TransitionModel>) -> Result<RunSummary> {
        let handle = match self.registry.lookup(&run.run_id) {
            Some(existing) => existing,
            None => self.registry.register(run.run_id.clone()),
        };

        let resume_from = match self.store.latest_checkpoint(&run.run_id).await? {
            Some(cp) => cp.batch_index + 1,
            None => 0,
        };
        let mut queue: VecDeque<(u64, DateTime<Utc>, DateTime<Utc>)> =
            batch_windows(&run).into_iter().filter(|(idx, _, _)| *idx >= resume_from).collect();
        info!(run_id = %run.run_id, resume_from, remaining = queue.len(), "coordinator starting run");

        let mut completed_indices: BTreeSet<u64> = (0..resume_from).collect();
        let mut next_checkpoint_index = resume_from;
        let mut batches_completed = 0u64;
        let mut batches_failed = 0u64;
        let mut paused = false;
        // Latched, not a bare threshold check: once pressure trips
        // `high_water_mark` dispatch stays paused until it falls all the way
        // to `low_water_mark`, so the two thresholds don't thrash against
        // each other near a single boundary (spec §4.9).
        let mut backpressure_paused = false;

        let mut in_flight: JoinSet<(u64, Result<BatchResult>)> = JoinSet::new();
        let concurrency = run.concurrency.max(1);

        loop {
            // Drain everything that has finished without blocking, so the
            // dispatch loop below always sees an up-to-date `in_flight.len()`.
            while let Some(joined) = in_flight.try_join_next() {
                let (batch_index, outcome) = joined.map_err(|e| PulseError::Unknown(format!("batch task panicked: {e}")))?;
                self.handle_batch_outcome(
                    &run,
                    batch_index,
                    outcome,
                    &mut completed_indices,
                    &mut next_checkpoint_index,
                    &mut batches_completed,
                    &mut batches_failed,
                )
                .await?;
            }

            if handle.cancel_token.is_cancelled() {
                break;
            }

            if self.cost_controller.is_blocked(&run.run_id) {
                paused = true;
                break;
            }

            if queue.is_empty() {
                if in_flight.is_empty() {
                    break;
                }
                if let Some(joined) = in_flight.join_next().await {
                    let (batch_index, outcome) = joined.map_err(|e| PulseError::Unknown(format!("batch task panicked: {e}")))?;
                    self.handle_batch_outcome(
                        &run,
                        batch_index,
                        outcome,
                        &mut completed_indices,
                        &mut next_checkpoint_index,
                        &mut batches_completed,
                        &mut batches_failed,
                    )
                    .await?;
                }
                continue;
            }

            if in_flight.len() >= concurrency {
                if let Some(joined) = in_flight.join_next().await {
                    let (batch_index, outcome) = joined.map_err(|e| PulseError::Unknown(format!("batch task panicked: {e}")))?;
                    self.handle_batch_outcome(
                        &run,
                        batch_index,
                        outcome,
                        &mut completed_indices,
                        &mut next_checkpoint_index,
                        &mut batches_completed,
                        &mut batches_failed,
                    )
                    .await?;
                }
                continue;
            }

            let pressure = self.pressure();
            if !backpressure_paused && pressure >= self.config.backpressure.high_water_mark {
                backpressure_paused = true;
            } else if backpressure_paused && pressure <= self.config.backpressure.low_water_mark {
                backpressure_paused = false;
            }
            if backpressure_paused {
                self.emit_metric(&run.run_id, "coordinator.backpressure", pressure).await;
                tokio::time::sleep(self.config.backpressure.poll_interval).await;
                continue;
            }

            let (batch_index, window_start, window_end) = queue.front().cloned().expect("checked non-empty above");

            let estimate = source.estimated_compute_units(&run, batch_index).await?;
            if let Err(e) = self.cost_controller.check_and_admit(&run.run_id, "compute_units", estimate, &run.budget) {
                self.emit_metric(&run.run_id, "coordinator.budget_pressure", estimate).await;
                if matches!(strategy_for(classify(&e)), RecoveryStrategy::AbortRun) {
                    warn!(run_id = %run.run_id, batch_index, "budget exceeded, pausing run");
                    paused = true;
                    break;
                }
                tokio::time::sleep(self.config.backpressure.poll_interval).await;
                continue;
            }

            queue.pop_front();
            let worker = self.worker.clone();
            let source = source.clone();
            let model = model.clone();
            let cancel = handle.cancel_token.clone();
            let run_for_task = run.clone();
            in_flight.spawn(async move {
                let result =
                    Self::run_one_batch(&worker, source.as_ref(), model, &run_for_task, batch_index, (window_start, window_end), &cancel)
                        .await;
                (batch_index, result)
            });
        }

        // Graceful drain: let whatever is already in flight finish (or
        // observe cancellation and stop cleanly) before returning.
        while let Some(joined) = in_flight.join_next().await {
            let (batch_index, outcome) = joined.map_err(|e| PulseError::Unknown(format!("batch task panicked: {e}")))?;
            self.handle_batch_outcome(
                &run,
                batch_index,
                outcome,
                &mut completed_indices,
                &mut next_checkpoint_index,
                &mut batches_completed,
                &mut batches_failed,
            )
            .await?;
        }

        let cancelled = handle.cancel_token.is_cancelled();
        if cancelled {
            self.registry.cancel(&run.run_id).ok();
        } else if !paused && queue.is_empty() {
            self.registry.complete(&run.run_id)?;
        }

        Ok(RunSummary {
            run_id: run.run_id.clone(),
            batches_completed,
            batches_failed,
            paused,
            cancelled,
        })
    }

    /// Applies one finished batch's outcome: record stats, and checkpoint
    /// forward past every contiguously-completed index (never skipping
    /// ahead over a still-missing earlier batch, even if a later one
    /// finished first — spec §4.9 "reschedules all batches with
    /// `batch_index` greater than the checkpoint's highest completed
    /// index" requires that frontier to be gap-free).
    #[allow(clippy::too_many_arguments)]
    async fn handle_batch_outcome(
        &self,
        run: &RunSpec,
        batch_index: u64,
        outcome: Result<BatchResult>,
        completed_indices: &mut BTreeSet<u64>,
        next_checkpoint_index: &mut u64,
        batches_completed: &mut u64,
        batches_failed: &mut u64,
    ) -> Result<()> {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(run_id = %run.run_id, batch_index, error = %e, "batch failed after exhausting retries");
                *batches_failed += 1;
                if run.fail_fast {
                    return Err(e);
                }
                return Ok(());
            }
        };

        match result.status {
            BatchStatus::Completed => {
                completed_indices.insert(batch_index);
                *batches_completed += 1;
                while completed_indices.contains(next_checkpoint_index) {
                    self.checkpoint_after_batch(run, *next_checkpoint_index).await?;
                    *next_checkpoint_index += 1;
                }
            }
            BatchStatus::Failed => {
                *batches_failed += 1;
                for warning in &result.warnings {
                    warn!(run_id = %run.run_id, batch_index, %warning, "batch reported failure");
                }
                if run.fail_fast {
                    return Err(PulseError::PipelineError {
                        step_id: format!("batch-{batch_index}"),
                        cause: result.warnings.join("; "),
                    });
                }
            }
            BatchStatus::Cancelled => {
                // Discarded, not applied to trust (spec §4.9 "results
                // received after cancellation are discarded").
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureProcessor, Pipeline, PipelineStepSpec};
    use crate::metrics_collector::CollectorConfig;
    use crate::metrics_store::MetricsStore;
    use crate::retrodiction::TimeStep;
    use crate::store::backend::{BlobBackend, FilesystemBackend};
    use crate::store::StoreConfig;
    use crate::trust::TrustPrior;
    use crate::types::{AttributionMode, Budget, ItemMetadata as TypesItemMetadata, RetryPolicy};
    use std::collections::HashMap;

    struct ConstantModel;
    impl TransitionModel for ConstantModel {
        fn predict(&self, _variable: &str, _step_index: usize, _state: &HashMap<String, f64>) -> Result<f64> {
            Ok(0.0)
        }
    }

    struct FixedBatchSource {
        baseline_ref: String,
        run_id: String,
        residuals: Vec<f64>,
    }

    #[async_trait]
    impl BatchSource for FixedBatchSource {
        async fn load_batch(&self, run: &RunSpec, batch_index: u64, window: (DateTime<Utc>, DateTime<Utc>)) -> Result<RetrodictionBatch> {
            let observed = *self.residuals.get(batch_index as usize).unwrap_or(&0.0);
            let mut step = TimeStep::default();
            step.observed.insert("a".to_string(), observed);
            step.fired_rules.insert("a".to_string(), vec!["r_a".to_string()]);
            Ok(RetrodictionBatch {
                batch_index,
                run_id: self.run_id.clone(),
                window_start: window.0,
                window_end: window.1,
                variables: vec!["a".to_string()],
                pipeline_id: run.pipeline_id.clone(),
                baseline_features_ref: self.baseline_ref.clone(),
                attribution_mode: run.attribution_mode,
                steps: vec![step],
                cost_per_step: 1.0,
            })
        }

        async fn estimated_compute_units(&self, _run: &RunSpec, _batch_index: u64) -> Result<f64> {
            Ok(1.0)
        }
    }

    async fn harness() -> (tempfile::TempDir, Coordinator, Arc<ProcessRegistry>, Arc<CostController>, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(StoreConfig { root: dir.path().join("store"), ..StoreConfig::default() }).await.unwrap());

        let feature_backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(dir.path().join("features")));
        let feature_processor = Arc::new(FeatureProcessor::open(feature_backend, dir.path().join("features.ptr")).await.unwrap());

        let item_id = store
            .put_item("seed", "test", b"seed".to_vec(), TypesItemMetadata { canonical_fields: HashMap::from([("seed".to_string(), "0".to_string())]), extra: HashMap::new() })
            .await
            .unwrap();
        let pipeline = Pipeline::new(vec![PipelineStepSpec {
            step_id: "schema_projection".to_string(),
            step_version: 1,
            params: serde_json::json!({"fields": ["seed"]}),
        }]);
        let baseline_feature_id = feature_processor.process(&store, vec![item_id], &pipeline).await.unwrap();

        let trust_tracker = Arc::new(TrustTracker::new(TrustPrior::default()));
        let trust_buffer = TrustUpdateBuffer::new(trust_tracker.clone(), Default::default());
        let metrics_store = Arc::new(MetricsStore::new());
        let metrics_collector = Arc::new(MetricsCollector::spawn(metrics_store.clone(), store.clone(), CollectorConfig::default(), vec![]));
        let registry = Arc::new(ProcessRegistry::new());
        let cost_controller = Arc::new(CostController::new(metrics_store.clone()));
        let worker = Arc::new(RetrodictionWorker::new(feature_processor, trust_buffer.clone(), metrics_store));

        let coordinator = Coordinator::new(
            store,
            registry.clone(),
            cost_controller.clone(),
            trust_buffer,
            trust_tracker,
            metrics_collector,
            worker,
            CoordinatorConfig::default(),
        );
        (dir, coordinator, registry, cost_controller, baseline_feature_id)
    }

    fn sample_run(run_id: &str, budget: Budget) -> RunSpec {
        RunSpec {
            run_id: run_id.to_string(),
            start_time: "2024-01-01T00:00:00Z".parse().unwrap(),
            end_time: "2024-01-08T00:00:00Z".parse().unwrap(),
            variables: vec!["a".to_string()],
            batch_size: chrono::Duration::days(1),
            concurrency: 4,
            budget,
            retry_policy: RetryPolicy::default(),
            pipeline_id: "pipeline-1".to_string(),
            attribution_mode: AttributionMode::Binary,
            fail_fast: false,
        }
    }

    #[tokio::test]
    async fn full_run_dispatches_every_batch_and_completes() {
        let (_dir, coordinator, registry, _cost, baseline_ref) = harness().await;
        let run = sample_run("run-full", Budget { api_calls: 1000.0, compute_units: 1000.0, storage_ops: 1000.0 });
        let source = Arc::new(FixedBatchSource {
            baseline_ref,
            run_id: run.run_id.clone(),
            residuals: vec![0.1, -0.1, 0.0, 0.2, -0.2, 0.0, 0.1],
        });
        let model = Arc::new(ConstantModel);

        let summary = coordinator.run(run.clone(), source, model).await.unwrap();

        assert_eq!(summary.batches_completed, 7);
        assert_eq!(summary.batches_failed, 0);
        assert!(!summary.paused);
        assert!(!summary.cancelled);
        assert_eq!(registry.lookup(&run.run_id).unwrap().status(), crate::process::RunStatus::Completed);

        let checkpoint = coordinator.store.latest_checkpoint(&run.run_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.batch_index, 6);
    }

    #[tokio::test]
    async fn budget_cap_pauses_after_admitted_batches_then_resumes_when_raised() {
        // concurrency=1 so cost admission for batch N always sees batch
        // N-1's charged cost already recorded (deterministic count of
        // admitted batches); the Cost Controller's admission gate doesn't
        // itself serialize concurrent dispatch.
        let (_dir, coordinator, _registry, cost_controller, baseline_ref) = harness().await;
        let mut run = sample_run("run-budget", Budget { api_calls: 1000.0, compute_units: 3.0, storage_ops: 1000.0 });
        run.concurrency = 1;
        let source = Arc::new(FixedBatchSource {
            baseline_ref: baseline_ref.clone(),
            run_id: run.run_id.clone(),
            residuals: vec![0.1, -0.1, 0.0, 0.2, -0.2, 0.0, 0.1],
        });
        let model = Arc::new(ConstantModel);

        let summary = coordinator.run(run.clone(), source.clone(), model.clone()).await.unwrap();
        assert_eq!(summary.batches_completed, 3);
        assert!(summary.paused);

        cost_controller.unblock(&run.run_id);
        let mut raised_run = sample_run("run-budget", Budget { api_calls: 1000.0, compute_units: 7.0, storage_ops: 1000.0 });
        raised_run.concurrency = 1;
        let resumed = coordinator.run(raised_run, source, model).await.unwrap();
        assert_eq!(resumed.batches_completed, 4);
        assert!(!resumed.paused);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_discards_in_flight_results() {
        let (_dir, coordinator, registry, _cost, baseline_ref) = harness().await;
        let run = sample_run("run-cancel", Budget { api_calls: 1000.0, compute_units: 1000.0, storage_ops: 1000.0 });
        let source = Arc::new(FixedBatchSource { baseline_ref, run_id: run.run_id.clone(), residuals: vec![0.1; 7] });
        let model = Arc::new(ConstantModel);

        let handle = registry.register(run.run_id.clone());
        handle.cancel_token.cancel();

        let summary = coordinator.run(run.clone(), source, model).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.batches_completed, 0);
    }

    /// Spec §8 seed scenario 2: a run checkpoints its first few batches,
    /// the process is lost, and a restart resumes from the checkpoint
    /// rather than redoing completed work. The resumed run's final trust
    /// state for `r_a` must match an uninterrupted run over the same
    /// residuals exactly, since `checkpoint_after_batch` flushes the trust
    /// buffer before snapshotting and `restore_trust_snapshot` hydrates a
    /// fresh tracker from that snapshot.
    #[tokio::test]
    async fn crash_and_resume_trust_state_matches_uninterrupted_run() {
        let residuals = vec![0.1, -0.1, 0.0, 0.2, -0.2, 0.0, 0.1];
        let budget = Budget { api_calls: 1000.0, compute_units: 1000.0, storage_ops: 1000.0 };

        // Uninterrupted baseline: full run's final trust mean for `r_a`.
        let (_dir1, coordinator1, _registry1, _cost1, baseline1) = harness().await;
        let run1 = sample_run("run-uninterrupted", budget.clone());
        let source1 = Arc::new(FixedBatchSource { baseline_ref: baseline1, run_id: run1.run_id.clone(), residuals: residuals.clone() });
        let summary1 = coordinator1.run(run1.clone(), source1, Arc::new(ConstantModel)).await.unwrap();
        assert_eq!(summary1.batches_completed, 7);
        let expected_mean = coordinator1.trust_tracker.mean("r_a");

        // State that survives a simulated crash: the store (items,
        // checkpoints) and the feature cache, built independently of any
        // particular `Coordinator` instance.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(StoreConfig { root: dir.path().join("store"), ..StoreConfig::default() }).await.unwrap());
        let feature_backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(dir.path().join("features")));
        let feature_processor = Arc::new(FeatureProcessor::open(feature_backend, dir.path().join("features.ptr")).await.unwrap());
        let item_id = store
            .put_item(
                "seed",
                "test",
                b"seed".to_vec(),
                TypesItemMetadata { canonical_fields: HashMap::from([("seed".to_string(), "0".to_string())]), extra: HashMap::new() },
            )
            .await
            .unwrap();
        let pipeline = Pipeline::new(vec![PipelineStepSpec {
            step_id: "schema_projection".to_string(),
            step_version: 1,
            params: serde_json::json!({"fields": ["seed"]}),
        }]);
        let baseline_ref = feature_processor.process(&store, vec![item_id], &pipeline).await.unwrap();

        let run2 = sample_run("run-crash", budget);
        let source2 = Arc::new(FixedBatchSource { baseline_ref, run_id: run2.run_id.clone(), residuals });
        let model: Arc<dyn TransitionModel> = Arc::new(ConstantModel);

        // Pre-crash process: run and checkpoint the first three batches,
        // then drop every in-memory service, simulating an exit.
        {
            let trust_tracker = Arc::new(TrustTracker::new(TrustPrior::default()));
            let trust_buffer = TrustUpdateBuffer::new(trust_tracker.clone(), Default::default());
            let metrics_store = Arc::new(MetricsStore::new());
            let metrics_collector = Arc::new(MetricsCollector::spawn(metrics_store.clone(), store.clone(), CollectorConfig::default(), vec![]));
            let registry = Arc::new(ProcessRegistry::new());
            let cost_controller = Arc::new(CostController::new(metrics_store.clone()));
            let worker = Arc::new(RetrodictionWorker::new(feature_processor.clone(), trust_buffer.clone(), metrics_store));
            let coordinator = Coordinator::new(
                store.clone(),
                registry,
                cost_controller,
                trust_buffer,
                trust_tracker,
                metrics_collector,
                worker,
                CoordinatorConfig::default(),
            );

            let cancel = CancelToken::new();
            for batch_index in 0..3u64 {
                let (_, window_start, window_end) = batch_windows(&run2)[batch_index as usize];
                let batch = source2.load_batch(&run2, batch_index, (window_start, window_end)).await.unwrap();
                coordinator.worker.execute_batch(batch, model.clone(), &cancel).await.unwrap();
                coordinator.checkpoint_after_batch(&run2, batch_index).await.unwrap();
            }
        }

        // Restarted process: fresh trust tracker, hydrated from the
        // checkpoint, resumes dispatch on the surviving store and feature
        // cache.
        let trust_tracker2 = Arc::new(TrustTracker::new(TrustPrior::default()));
        let trust_buffer2 = TrustUpdateBuffer::new(trust_tracker2.clone(), Default::default());
        let metrics_store2 = Arc::new(MetricsStore::new());
        let metrics_collector2 = Arc::new(MetricsCollector::spawn(metrics_store2.clone(), store.clone(), CollectorConfig::default(), vec![]));
        let registry2 = Arc::new(ProcessRegistry::new());
        let cost_controller2 = Arc::new(CostController::new(metrics_store2.clone()));
        let worker2 = Arc::new(RetrodictionWorker::new(feature_processor, trust_buffer2.clone(), metrics_store2));
        let coordinator2 = Coordinator::new(
            store.clone(),
            registry2,
            cost_controller2,
            trust_buffer2,
            trust_tracker2.clone(),
            metrics_collector2,
            worker2,
            CoordinatorConfig::default(),
        );

        coordinator2.restore_trust_snapshot(&run2.run_id).await.unwrap();
        let resumed = coordinator2.run(run2.clone(), source2, model).await.unwrap();
        assert_eq!(resumed.batches_completed, 4, "only the post-checkpoint batches should dispatch");
        assert_eq!(resumed.batches_failed, 0);

        let checkpoint = store.latest_checkpoint(&run2.run_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.batch_index, 6);

        let resumed_mean = trust_tracker2.mean("r_a");
        assert!((resumed_mean - expected_mean).abs() < 1e-9, "resumed trust mean {resumed_mean} != uninterrupted {expected_mean}");
    }
}
