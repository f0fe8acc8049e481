//! Crate-level integration scenarios, exercised through the public
//! `PulseContext` bootstrap path rather than any module's internals
//! (spec.md §8's seed scenarios 1 and 2).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pulse_core::config::ConfigOverrides;
use pulse_core::coordinator::BatchSource;
use pulse_core::feature::{Pipeline, PipelineStepSpec};
use pulse_core::process::RunStatus;
use pulse_core::retrodiction::{RetrodictionBatch, TimeStep, TransitionModel};
use pulse_core::store::Store;
use pulse_core::types::{AttributionMode, Budget, ItemMetadata, RetryPolicy, RunSpec};
use pulse_core::PulseContext;

struct ConstantModel;
impl TransitionModel for ConstantModel {
    fn predict(&self, _variable: &str, _step_index: usize, _state: &HashMap<String, f64>) -> pulse_core::error::Result<f64> {
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
    async fn load_batch(
        &self,
        run: &RunSpec,
        batch_index: u64,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> pulse_core::error::Result<RetrodictionBatch> {
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

    async fn estimated_compute_units(&self, _run: &RunSpec, _batch_index: u64) -> pulse_core::error::Result<f64> {
        Ok(1.0)
    }
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

async fn seed_baseline_feature(store: &Store, feature_processor: &pulse_core::feature::FeatureProcessor) -> String {
    let item_id = store
        .put_item(
            "seed",
            "test",
            b"seed".to_vec(),
            ItemMetadata { canonical_fields: HashMap::from([("seed".to_string(), "0".to_string())]), extra: HashMap::new() },
        )
        .await
        .unwrap();
    let pipeline = Pipeline::new(vec![PipelineStepSpec {
        step_id: "schema_projection".to_string(),
        step_version: 1,
        params: serde_json::json!({"fields": ["seed"]}),
    }]);
    feature_processor.process(store, vec![item_id], &pipeline).await.unwrap()
}

/// Spec §8 seed scenario 1: a full run over the worked residual sequence
/// completes every batch, checkpoints the last one, and leaves `r_a`'s
/// trust above its prior (more reductions than inflations in this
/// sequence), driven entirely through `PulseContext::bootstrap`.
#[tokio::test]
async fn bootstrap_runs_a_full_retrodiction_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let overrides = ConfigOverrides { store_root: Some(dir.path().to_path_buf()), ..Default::default() };
    let ctx = PulseContext::bootstrap(None, overrides).await.unwrap();

    let baseline_ref = seed_baseline_feature(&ctx.store, &ctx.feature_processor).await;
    let run = sample_run("run-e2e-full", Budget { api_calls: 1000.0, compute_units: 1000.0, storage_ops: 1000.0 });
    let source = Arc::new(FixedBatchSource {
        baseline_ref,
        run_id: run.run_id.clone(),
        residuals: vec![0.1, -0.1, 0.0, 0.2, -0.2, 0.0, 0.1],
    });
    let model = Arc::new(ConstantModel);

    let summary = ctx.coordinator.run(run.clone(), source, model).await.unwrap();
    assert_eq!(summary.batches_completed, 7);
    assert_eq!(summary.batches_failed, 0);
    assert!(!summary.paused);
    assert!(!summary.cancelled);

    let prior_mean = ctx.trust_tracker.mean("r_a_nonexistent");
    let final_mean = ctx.trust_tracker.mean("r_a");
    assert!(final_mean > prior_mean, "more reductions than inflations should raise trust above the prior");

    let checkpoint = ctx.store.latest_checkpoint(&run.run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.batch_index, 6);

    ctx.shutdown().await.unwrap();
}

/// Spec §8 seed scenario 2: a run pauses partway through on a tight
/// budget (standing in for a process crash, since it stops dispatch at a
/// deterministic point), the process exits, and a second `PulseContext`
/// bootstrapped against the same store root resumes from the checkpoint
/// instead of redoing completed batches.
#[tokio::test]
async fn crash_and_resume_survives_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let run_id = "run-e2e-resume";
    let residuals = vec![0.1, -0.1, 0.0, 0.2, -0.2, 0.0, 0.1];

    let batches_completed_before_restart = {
        let overrides = ConfigOverrides { store_root: Some(dir.path().to_path_buf()), ..Default::default() };
        let ctx = PulseContext::bootstrap(None, overrides).await.unwrap();
        let baseline_ref = seed_baseline_feature(&ctx.store, &ctx.feature_processor).await;

        let mut run = sample_run(run_id, Budget { api_calls: 1000.0, compute_units: 3.0, storage_ops: 1000.0 });
        run.concurrency = 1;
        let source = Arc::new(FixedBatchSource { baseline_ref, run_id: run.run_id.clone(), residuals: residuals.clone() });
        let model = Arc::new(ConstantModel);

        let summary = ctx.coordinator.run(run, source, model).await.unwrap();
        assert!(summary.paused, "tight budget should pause dispatch rather than run to completion");
        assert!(summary.batches_completed < 7);
        let completed = summary.batches_completed;
        // The crash this models discards every in-memory service (trust
        // tracker, registry, cost controller) while leaving on-disk state
        // (store, checkpoints) intact; `shutdown` here only joins this
        // context's background tasks so they don't race the next
        // `bootstrap`'s reopen of the same store root within this process.
        ctx.shutdown().await.unwrap();
        completed
    };

    let overrides = ConfigOverrides {
        store_root: Some(dir.path().to_path_buf()),
        default_budget: Some(Budget { api_calls: 1000.0, compute_units: 1000.0, storage_ops: 1000.0 }),
        ..Default::default()
    };
    let ctx = PulseContext::bootstrap(None, overrides).await.unwrap();
    ctx.reconstruct_runs(&[run_id.to_string()]).await.unwrap();
    assert_eq!(ctx.registry.lookup(run_id).unwrap().status(), RunStatus::Running);

    let baseline_ref = seed_baseline_feature(&ctx.store, &ctx.feature_processor).await;
    let mut raised_run = sample_run(run_id, Budget { api_calls: 1000.0, compute_units: 1000.0, storage_ops: 1000.0 });
    raised_run.concurrency = 1;
    let source = Arc::new(FixedBatchSource { baseline_ref, run_id: raised_run.run_id.clone(), residuals });
    let model = Arc::new(ConstantModel);

    let resumed = ctx.coordinator.run(raised_run, source, model).await.unwrap();
    assert_eq!(
        batches_completed_before_restart + resumed.batches_completed,
        7,
        "resume must cover exactly the batches the crashed process left undone"
    );
    assert!(!resumed.paused);

    let checkpoint = ctx.store.latest_checkpoint(run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.batch_index, 6);

    ctx.shutdown().await.unwrap();
}
