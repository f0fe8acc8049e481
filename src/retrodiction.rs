//! Retrodiction Worker (spec §4.8).
//!
//! Executes one training batch: reconstructs state from a baseline
//! feature vector, walks a time-ordered window applying a caller-supplied
//! transition model, computes predicted-vs-observed residuals, and
//! attributes residual reduction or inflation to the rules that fired at
//! each step, via a cancellation-aware step-by-step loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::feature::FeatureProcessor;
use crate::metrics_store::MetricsStore;
use crate::process::CancelToken;
use crate::trust_buffer::TrustUpdateBuffer;
use crate::types::{AttributionMode, CostEvent, FeatureValues, MetricEvent, RunId, TrustUpdate};

/// The model's inverse/transition function applied at each retrodiction
/// step (design-level algorithm, step 3). Left pluggable: the spec
/// describes the shape of retrodiction, not a specific model.
pub trait TransitionModel: Send + Sync {
    /// Predict `variable`'s value at `step_index` given the running
    /// reconstructed `state`.
    fn predict(&self, variable: &str, step_index: usize, state: &HashMap<String, f64>) -> Result<f64>;
}

/// One time-ordered tick within a batch.
#[derive(Debug, Clone, Default)]
pub struct TimeStep {
    /// Observed value per variable at this step. A variable absent here
    /// was not observed at this tick and is skipped for it.
    pub observed: HashMap<String, f64>,
    /// Rule ids credited with firing on each variable at this step.
    pub fired_rules: HashMap<String, Vec<String>>,
}

/// Inputs to one retrodiction batch (spec §4.8).
#[derive(Debug, Clone)]
pub struct RetrodictionBatch {
    pub batch_index: u64,
    pub run_id: RunId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub variables: Vec<String>,
    pub pipeline_id: String,
    pub baseline_features_ref: String,
    pub attribution_mode: AttributionMode,
    pub steps: Vec<TimeStep>,
    /// Compute cost charged per step, used to build the batch's `CostEvent`s.
    pub cost_per_step: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VariableMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub coverage: f64,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub status: BatchStatus,
    pub metrics_summary: HashMap<String, VariableMetrics>,
    pub trust_updates_count: usize,
    pub warnings: Vec<String>,
}

struct RunningStats {
    count: u64,
    abs_sum: f64,
    sq_sum: f64,
    y_sum: f64,
    y_sq_sum: f64,
}

impl RunningStats {
    fn new() -> Self {
        Self { count: 0, abs_sum: 0.0, sq_sum: 0.0, y_sum: 0.0, y_sq_sum: 0.0 }
    }

    fn observe(&mut self, predicted: f64, observed: f64) {
        let residual = observed - predicted;
        self.count += 1;
        self.abs_sum += residual.abs();
        self.sq_sum += residual * residual;
        self.y_sum += observed;
        self.y_sq_sum += observed * observed;
    }

    fn finish(&self, total_steps: u64) -> VariableMetrics {
        if self.count == 0 {
            return VariableMetrics::default();
        }
        let n = self.count as f64;
        let mae = self.abs_sum / n;
        let rmse = (self.sq_sum / n).sqrt();
        let mean_y = self.y_sum / n;
        let ss_tot = self.y_sq_sum - n * mean_y * mean_y;
        let r2 = if ss_tot > 0.0 { 1.0 - self.sq_sum / ss_tot } else if self.sq_sum == 0.0 { 1.0 } else { 0.0 };
        let coverage = n / total_steps as f64;
        VariableMetrics { mae, rmse, r2, coverage }
    }
}

/// Classifies residual reduction (success, credit) vs inflation (failure,
/// blame) relative to the previous step's magnitude for the same
/// variable. The very first step compares against an assumed-zero prior
/// residual.
fn is_reduction(previous_abs_residual: f64, residual: f64) -> bool {
    residual.abs() <= previous_abs_residual
}

/// Executes retrodiction batches (spec §4.8).
pub struct RetrodictionWorker {
    feature_processor: Arc<FeatureProcessor>,
    trust_buffer: Arc<TrustUpdateBuffer>,
    metrics_store: Arc<MetricsStore>,
}

impl RetrodictionWorker {
    pub fn new(feature_processor: Arc<FeatureProcessor>, trust_buffer: Arc<TrustUpdateBuffer>, metrics_store: Arc<MetricsStore>) -> Self {
        Self { feature_processor, trust_buffer, metrics_store }
    }

    async fn load_baseline_state(&self, batch: &RetrodictionBatch) -> Result<HashMap<String, f64>> {
        let record = self.feature_processor.get(&batch.baseline_features_ref).await?;
        let mut state = match record.values {
            FeatureValues::Named(values) => values,
            // A dense baseline carries no field names to align with
            // `batch.variables`; every variable starts from zero instead.
            FeatureValues::Dense(_) => HashMap::new(),
        };
        for variable in &batch.variables {
            state.entry(variable.clone()).or_insert(0.0);
        }
        Ok(state)
    }

    /// Run one batch to completion, cancellation, or failure. Cost events
    /// already charged before a stop are kept; trust updates and the
    /// metrics summary are only published if the batch completes cleanly
    /// (spec §7: partial work is not published).
    pub async fn execute_batch(&self, batch: RetrodictionBatch, model: Arc<dyn TransitionModel>, cancel: &CancelToken) -> Result<BatchResult> {
        let mut state = self.load_baseline_state(&batch).await?;
        let mut previous_abs_residual: HashMap<String, f64> = batch.variables.iter().map(|v| (v.clone(), 0.0)).collect();
        let mut stats: HashMap<String, RunningStats> = batch.variables.iter().map(|v| (v.clone(), RunningStats::new())).collect();
        let mut pending_updates: Vec<TrustUpdate> = Vec::new();
        let mut warnings = Vec::new();

        for (step_index, step) in batch.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                self.charge_cost(&batch, step_index as u64).await?;
                return Ok(BatchResult { status: BatchStatus::Cancelled, metrics_summary: HashMap::new(), trust_updates_count: 0, warnings });
            }

            for variable in &batch.variables {
                let Some(&observed) = step.observed.get(variable) else { continue };
                let predicted = match model.predict(variable, step_index, &state) {
                    Ok(p) => p,
                    Err(err) => {
                        self.charge_cost(&batch, step_index as u64).await?;
                        warnings.push(format!("{variable} step {step_index}: {err}"));
                        return Ok(BatchResult { status: BatchStatus::Failed, metrics_summary: HashMap::new(), trust_updates_count: 0, warnings });
                    }
                };
                let residual = observed - predicted;
                let prev = *previous_abs_residual.get(variable).unwrap_or(&0.0);
                let reduction = is_reduction(prev, residual);

                if let Some(entry) = stats.get_mut(variable) {
                    entry.observe(predicted, observed);
                }
                previous_abs_residual.insert(variable.clone(), residual.abs());
                state.insert(variable.clone(), observed);

                if let Some(rule_ids) = step.fired_rules.get(variable) {
                    for rule_id in rule_ids {
                        let (successes, failures) = match batch.attribution_mode {
                            AttributionMode::Binary => if reduction { (1.0, 0.0) } else { (0.0, 1.0) },
                            AttributionMode::Proportional => {
                                let magnitude = residual.abs().max(1e-9);
                                if reduction { (1.0 / magnitude, 0.0) } else { (0.0, magnitude) }
                            }
                        };
                        pending_updates.push(TrustUpdate::new(rule_id.clone(), successes, failures));
                    }
                }
            }
        }

        self.charge_cost(&batch, batch.steps.len() as u64).await?;

        let trust_updates_count = pending_updates.len();
        for update in pending_updates {
            self.trust_buffer.push(update).await?;
        }

        let total_steps = batch.steps.len() as u64;
        let metrics_summary: HashMap<String, VariableMetrics> = stats.iter().map(|(k, v)| (k.clone(), v.finish(total_steps))).collect();
        self.emit_metric_summary(&batch, &metrics_summary).await?;

        Ok(BatchResult { status: BatchStatus::Completed, metrics_summary, trust_updates_count, warnings })
    }

    async fn charge_cost(&self, batch: &RetrodictionBatch, steps_processed: u64) -> Result<()> {
        if steps_processed == 0 {
            return Ok(());
        }
        self.metrics_store
            .put_cost_events(vec![CostEvent {
                run_id: batch.run_id.clone(),
                category: "compute_units".to_string(),
                units: steps_processed as f64,
                cost: batch.cost_per_step * steps_processed as f64,
                at: Utc::now(),
            }])
            .await
    }

    async fn emit_metric_summary(&self, batch: &RetrodictionBatch, summary: &HashMap<String, VariableMetrics>) -> Result<()> {
        let mut events = Vec::with_capacity(summary.len() * 4);
        for (variable, metrics) in summary {
            for (name, value) in [("mae", metrics.mae), ("rmse", metrics.rmse), ("r2", metrics.r2), ("coverage", metrics.coverage)] {
                let mut tags = HashMap::new();
                tags.insert("variable".to_string(), variable.clone());
                tags.insert("batch_index".to_string(), batch.batch_index.to_string());
                events.push(MetricEvent {
                    metric_id: Uuid::new_v4().to_string(),
                    run_id: batch.run_id.clone(),
                    name: name.to_string(),
                    value,
                    tags,
                    at: Utc::now(),
                });
            }
        }
        self.metrics_store.put_many(events).await
    }
}
