//! Metrics Store (spec §4.4).
//!
//! Append-only training-metric and cost-event log with a time index and
//! `(run_id, name)` secondary index: an `RwLock<Vec<_>>` append log plus
//! `DashMap` lookups keyed off the append position rather than a full
//! relational index.

use dashmap::DashMap;
use tokio::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{CostEvent, MetricEvent, RunId};

/// Aggregation function for [`MetricsStore::summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Sum,
    Min,
    Max,
    P50,
    P90,
    P99,
    Count,
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn aggregate(values: &mut [f64], agg: Aggregation) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match agg {
        Aggregation::Count => values.len() as f64,
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::P50 | Aggregation::P90 | Aggregation::P99 => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let p = match agg {
                Aggregation::P50 => 0.50,
                Aggregation::P90 => 0.90,
                Aggregation::P99 => 0.99,
                _ => unreachable!("handled above"),
            };
            percentile(values, p)
        }
    }
}

/// Append-only metric and cost event log (spec §4.4).
///
/// One writer at a time is expected (the Async Metrics Collector); reads are
/// concurrent and lock-free apart from the secondary index lookups.
pub struct MetricsStore {
    metrics: RwLock<Vec<MetricEvent>>,
    metrics_by_run: DashMap<RunId, Vec<usize>>,
    metrics_by_run_name: DashMap<(RunId, String), Vec<usize>>,

    costs: RwLock<Vec<CostEvent>>,
    cost_totals: DashMap<RunId, f64>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(Vec::new()),
            metrics_by_run: DashMap::new(),
            metrics_by_run_name: DashMap::new(),
            costs: RwLock::new(Vec::new()),
            cost_totals: DashMap::new(),
        }
    }

    /// Append a batch of metric events atomically: either all are visible to
    /// subsequent reads or none are (spec §4.4 "atomic within a single
    /// call").
    pub async fn put_many(&self, events: Vec<MetricEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut store = self.metrics.write().await;
        let base = store.len();
        for (offset, event) in events.iter().enumerate() {
            let idx = base + offset;
            self.metrics_by_run.entry(event.run_id.clone()).or_default().push(idx);
            self.metrics_by_run_name
                .entry((event.run_id.clone(), event.name.clone()))
                .or_default()
                .push(idx);
        }
        store.extend(events);
        Ok(())
    }

    /// Range query over metric events for a run, optionally filtered by
    /// metric name and/or a half-open time window.
    pub async fn range(
        &self,
        run_id: &str,
        name: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricEvent>> {
        let store = self.metrics.read().await;
        let indices: Vec<usize> = match name {
            Some(name) => self
                .metrics_by_run_name
                .get(&(run_id.to_string(), name.to_string()))
                .map(|v| v.clone())
                .unwrap_or_default(),
            None => self.metrics_by_run.get(run_id).map(|v| v.clone()).unwrap_or_default(),
        };
        Ok(indices
            .into_iter()
            .filter_map(|i| store.get(i))
            .filter(|e| from.map_or(true, |f| e.at >= f) && to.map_or(true, |t| e.at < t))
            .cloned()
            .collect())
    }

    /// Aggregate values for `(run_id, name)` under `agg`.
    pub async fn summary(&self, run_id: &str, name: &str, agg: Aggregation) -> Result<f64> {
        let mut values: Vec<f64> = self
            .range(run_id, Some(name), None, None)
            .await?
            .into_iter()
            .map(|e| e.value)
            .collect();
        Ok(aggregate(&mut values, agg))
    }

    /// Append cost events, updating each run's running total (spec §4.4
    /// "mirrors the metric path but maintains a running per-run_id total").
    pub async fn put_cost_events(&self, events: Vec<CostEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut store = self.costs.write().await;
        for event in &events {
            *self.cost_totals.entry(event.run_id.clone()).or_insert(0.0) += event.cost;
        }
        store.extend(events);
        Ok(())
    }

    /// Cost events for a run within an optional time window.
    pub async fn cost_range(
        &self,
        run_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<CostEvent>> {
        let store = self.costs.read().await;
        Ok(store
            .iter()
            .filter(|e| e.run_id == run_id)
            .filter(|e| from.map_or(true, |f| e.at >= f) && to.map_or(true, |t| e.at < t))
            .cloned()
            .collect())
    }

    /// Running total cost for a run, as tracked incrementally by
    /// [`Self::put_cost_events`] (used by the Cost Controller's admission
    /// checks without re-scanning the full event log).
    pub fn total_cost(&self, run_id: &str) -> f64 {
        self.cost_totals.get(run_id).map(|v| *v).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(run_id: &str, name: &str, value: f64, at: DateTime<Utc>) -> MetricEvent {
        MetricEvent {
            metric_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            name: name.to_string(),
            value,
            tags: HashMap::new(),
            at,
        }
    }

    #[tokio::test]
    async fn put_many_is_atomic_and_visible_together() {
        let store = MetricsStore::new();
        let now = Utc::now();
        store
            .put_many(vec![
                event("run-1", "loss", 1.0, now),
                event("run-1", "loss", 2.0, now),
            ])
            .await
            .unwrap();
        let all = store.range("run-1", Some("loss"), None, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn range_filters_by_name_and_window() {
        let store = MetricsStore::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);
        let t2 = t0 + chrono::Duration::seconds(20);
        store
            .put_many(vec![
                event("run-1", "loss", 1.0, t0),
                event("run-1", "acc", 0.5, t1),
                event("run-1", "loss", 3.0, t2),
            ])
            .await
            .unwrap();

        let loss_only = store.range("run-1", Some("loss"), None, None).await.unwrap();
        assert_eq!(loss_only.len(), 2);

        let windowed = store
            .range("run-1", None, Some(t1), Some(t2 + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[tokio::test]
    async fn summary_aggregations_match_expected_values() {
        let store = MetricsStore::new();
        let now = Utc::now();
        store
            .put_many(vec![
                event("run-1", "loss", 1.0, now),
                event("run-1", "loss", 2.0, now),
                event("run-1", "loss", 3.0, now),
                event("run-1", "loss", 4.0, now),
            ])
            .await
            .unwrap();

        assert_eq!(store.summary("run-1", "loss", Aggregation::Count).await.unwrap(), 4.0);
        assert_eq!(store.summary("run-1", "loss", Aggregation::Sum).await.unwrap(), 10.0);
        assert_eq!(store.summary("run-1", "loss", Aggregation::Mean).await.unwrap(), 2.5);
        assert_eq!(store.summary("run-1", "loss", Aggregation::Min).await.unwrap(), 1.0);
        assert_eq!(store.summary("run-1", "loss", Aggregation::Max).await.unwrap(), 4.0);
    }

    #[tokio::test]
    async fn summary_over_unknown_run_is_zero_not_error() {
        let store = MetricsStore::new();
        assert_eq!(store.summary("nope", "loss", Aggregation::Count).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn cost_events_accumulate_a_running_total_per_run() {
        let store = MetricsStore::new();
        let now = Utc::now();
        store
            .put_cost_events(vec![
                CostEvent { run_id: "run-1".into(), category: "compute".into(), units: 1.0, cost: 2.5, at: now },
                CostEvent { run_id: "run-1".into(), category: "storage".into(), units: 1.0, cost: 1.5, at: now },
                CostEvent { run_id: "run-2".into(), category: "compute".into(), units: 1.0, cost: 9.0, at: now },
            ])
            .await
            .unwrap();

        assert_eq!(store.total_cost("run-1"), 4.0);
        assert_eq!(store.total_cost("run-2"), 9.0);
        assert_eq!(store.total_cost("unknown-run"), 0.0);
    }
}
