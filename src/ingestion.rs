//! Ingestion Manager (spec §4.6).
//!
//! Drives pluggable [`SourceAdapter`]s to pull items into the Store under
//! per-adapter rate and poll-frequency limits, with schema validation at
//! the boundary and cost admission through the [`CostController`].
//! Scheduling uses the [`crate::process::TokenBucket`] rate limiter;
//! schema validation is built on the `jsonschema` crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonschema::Validator;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::SourceAdapter;
use crate::error::{PulseError, Result};
use crate::metrics_store::MetricsStore;
use crate::process::{CostController, RateLimit, TokenBucket};
use crate::store::Store;
use crate::types::{Budget, MetricEvent, RunId};

/// Per-adapter scheduling limits (spec §4.6).
#[derive(Debug, Clone)]
pub struct AdapterSchedule {
    pub rate_limit: RateLimit,
    /// Minimum spacing between successive polls, independent of the rate
    /// limiter (e.g. "at most once per day" for slow series). A poll whose
    /// `describe_schema()` reports a variable not yet seen for this adapter
    /// bypasses this cap once, for that poll only (spec §4.6) — this
    /// covers both an adapter's very first poll ever (every one of its
    /// variables is new) and a later poll where it discovers a new series.
    pub max_poll_frequency: Duration,
}

impl Default for AdapterSchedule {
    fn default() -> Self {
        Self { rate_limit: RateLimit::default(), max_poll_frequency: Duration::from_secs(0) }
    }
}

struct RegisteredAdapter {
    adapter: Arc<dyn SourceAdapter>,
    schedule: AdapterSchedule,
    bucket: Mutex<TokenBucket>,
}

/// Drives registered adapters to ingest items under budget and rate
/// constraints (spec §4.6).
pub struct IngestionManager {
    store: Arc<Store>,
    metrics: Arc<MetricsStore>,
    cost_controller: Arc<CostController>,
    adapters: DashMap<String, Arc<RegisteredAdapter>>,
    last_poll: DashMap<String, Instant>,
    /// Variable names already seen in a prior `describe_schema()` call, per
    /// adapter. A name not yet in this set is a newly discovered variable
    /// (spec §4.6) and bypasses `max_poll_frequency` for this one poll.
    known_variables: DashMap<String, std::collections::HashSet<String>>,
}

impl IngestionManager {
    pub fn new(store: Arc<Store>, metrics: Arc<MetricsStore>, cost_controller: Arc<CostController>) -> Self {
        Self {
            store,
            metrics,
            cost_controller,
            adapters: DashMap::new(),
            last_poll: DashMap::new(),
            known_variables: DashMap::new(),
        }
    }

    pub fn register_adapter(&self, adapter: Arc<dyn SourceAdapter>, schedule: AdapterSchedule) {
        let id = adapter.id().to_string();
        let bucket = Mutex::new(TokenBucket::new(schedule.rate_limit));
        self.adapters.insert(id, Arc::new(RegisteredAdapter { adapter, schedule, bucket }));
    }

    fn compile_validator(&self, adapter_id: &str, schema: &Value) -> Result<Validator> {
        jsonschema::validator_for(schema).map_err(|e| PulseError::AdapterError {
            kind: "invalid_schema".to_string(),
            cause: format!("{adapter_id}: {e}"),
        })
    }

    async fn emit_validation_error(&self, run_id: &str, adapter_id: &str, cause: &str) {
        warn!(run_id, adapter_id, cause, "item failed schema validation; dropped");
        let mut tags = HashMap::new();
        tags.insert("adapter_id".to_string(), adapter_id.to_string());
        let event = MetricEvent {
            metric_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            name: "ingestion.validation_error".to_string(),
            value: 1.0,
            tags,
            at: Utc::now(),
        };
        if let Err(e) = self.metrics.put_many(vec![event]).await {
            warn!(error = %e, "failed to record validation error metric");
        }
    }

    /// Pull one window of items from `adapter_id` into `dataset_id`,
    /// enforcing the poll-frequency cap, the adapter's token bucket, and
    /// the run's cost budget, then validating and storing each item.
    /// Returns the `item_id`s of everything actually stored (items that
    /// fail validation are dropped, not partially stored).
    pub async fn poll(
        &self,
        adapter_id: &str,
        dataset_id: &str,
        run_id: &RunId,
        window: (DateTime<Utc>, DateTime<Utc>),
        params: &Value,
        budget: &Budget,
    ) -> Result<Vec<String>> {
        let registered = self
            .adapters
            .get(adapter_id)
            .map(|e| e.clone())
            .ok_or_else(|| PulseError::AdapterError { kind: "not_found".to_string(), cause: adapter_id.to_string() })?;

        let schema = registered.adapter.describe_schema();
        let new_variables: Vec<String> = {
            let seen = self.known_variables.entry(adapter_id.to_string()).or_default();
            schema.variables.iter().filter(|v| !seen.contains(*v)).cloned().collect()
        };

        if new_variables.is_empty() {
            if let Some(last) = self.last_poll.get(adapter_id) {
                if last.elapsed() < registered.schedule.max_poll_frequency {
                    return Err(PulseError::AdapterError {
                        kind: "poll_too_frequent".to_string(),
                        cause: format!("{adapter_id} was polled {:?} ago, minimum spacing is {:?}", last.elapsed(), registered.schedule.max_poll_frequency),
                    });
                }
            }
        }

        if !registered.bucket.lock().try_consume(1) {
            return Err(PulseError::AdapterError { kind: "rate_limited".to_string(), cause: adapter_id.to_string() });
        }

        let estimate = registered.adapter.estimated_cost(window, params).await?;
        let now = Utc::now();
        self.cost_controller
            .record_cost(
                crate::types::CostEvent { run_id: run_id.clone(), category: "api_calls".to_string(), units: 1.0, cost: estimate.api_calls, at: now },
                budget,
            )
            .await?;
        self.cost_controller
            .record_cost(
                crate::types::CostEvent { run_id: run_id.clone(), category: "compute_units".to_string(), units: 1.0, cost: estimate.compute_units, at: now },
                budget,
            )
            .await?;

        self.last_poll.insert(adapter_id.to_string(), Instant::now());
        if !new_variables.is_empty() {
            let mut seen = self.known_variables.entry(adapter_id.to_string()).or_default();
            seen.extend(new_variables);
        }

        let validator = self.compile_validator(adapter_id, &schema.json_schema)?;

        let items = registered.adapter.fetch(window, params).await?;
        let mut stored_ids = Vec::with_capacity(items.len());
        for item in items {
            let instance = match serde_json::to_value(&item.metadata.canonical_fields) {
                Ok(v) => v,
                Err(e) => {
                    self.emit_validation_error(run_id, adapter_id, &e.to_string()).await;
                    continue;
                }
            };
            if !validator.is_valid(&instance) {
                let causes: Vec<String> = validator.iter_errors(&instance).map(|e| e.to_string()).collect();
                self.emit_validation_error(run_id, adapter_id, &causes.join("; ")).await;
                continue;
            }
            let id = self.store.put_item(dataset_id, adapter_id, item.payload, item.metadata).await?;
            stored_ids.push(id);
        }
        Ok(stored_ids)
    }
}
