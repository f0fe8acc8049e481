//! Feature Processor (spec §4.5).
//!
//! Deterministic, cacheable transforms from items to feature records. A
//! pipeline is an ordered list of steps; `pipeline_id`/`pipeline_version`
//! fall out of the canonical serialization of those steps' ids, versions,
//! and params, so any change to the pipeline invalidates the cache without
//! any bookkeeping beyond that derivation.
//!
//! The cache key is derived from content rather than chosen by the caller,
//! persisted through the same pointer-file pattern as
//! [`crate::store::checkpoint::CheckpointPointers`] (atomic temp+rename
//! persistence of a small id -> content-hash map alongside a content-
//! addressed blob backend).

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::content_hash::ContentHash;
use crate::error::{PulseError, Result};
use crate::store::backend::BlobBackend;
use crate::store::Store;
use crate::types::{FeatureRecord, FeatureValues, Item, ItemId};

/// One field of a pipeline row. Items' canonical metadata fields arrive as
/// strings; numeric ones are parsed eagerly so steps don't each re-parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

/// One row of a pipeline's working batch, keyed by field name.
pub type Row = HashMap<String, FieldValue>;
/// The batch a pipeline step transforms. Row order is item order; steps
/// that need history (rolling windows, rate-of-change) rely on that order.
pub type Batch = Vec<Row>;

fn number_field(row: &Row, field: &str) -> Option<f64> {
    match row.get(field) {
        Some(FieldValue::Number(n)) => Some(*n),
        _ => None,
    }
}

fn required_str<'a>(params: &'a Value, key: &str, step_id: &str) -> Result<&'a str> {
    params.get(key).and_then(Value::as_str).ok_or_else(|| PulseError::PipelineError {
        step_id: step_id.to_string(),
        cause: format!("missing required string param `{key}`"),
    })
}

fn row_from_item(item: &Item) -> Row {
    item.metadata
        .canonical_fields
        .iter()
        .map(|(k, v)| {
            let value = match v.parse::<f64>() {
                Ok(n) => FieldValue::Number(n),
                Err(_) => FieldValue::Text(v.clone()),
            };
            (k.clone(), value)
        })
        .collect()
}

/// A pure `(batch, params) -> batch` transform, identified by a stable
/// `step_id` and a `step_version` that bumps whenever its semantics change.
pub trait PipelineStep: Send + Sync {
    fn step_id(&self) -> &'static str;
    fn step_version(&self) -> u32;
    fn apply(&self, batch: Batch, params: &Value) -> Result<Batch>;
}

/// One step reference within a [`Pipeline`]: which step, which version the
/// caller expects to be registered, and its params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStepSpec {
    pub step_id: String,
    pub step_version: u32,
    #[serde(default)]
    pub params: Value,
}

/// An ordered sequence of steps. `pipeline_id`/`pipeline_version` are pure
/// functions of `steps`, per spec §4.5.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    pub steps: Vec<PipelineStepSpec>,
}

impl Pipeline {
    pub fn new(steps: Vec<PipelineStepSpec>) -> Self {
        Self { steps }
    }

    /// Canonical serialization steps are hashed over. `serde_json` preserves
    /// struct field order and the step list's own order is significant, so
    /// this does not need a `BTreeMap` re-sort the way `ContentHash::for_item`
    /// does for metadata.
    fn canonical_json(&self) -> String {
        serde_json::to_string(&self.steps).unwrap_or_default()
    }

    pub fn pipeline_id(&self) -> String {
        ContentHash::from_bytes(self.canonical_json().as_bytes()).to_hex()
    }

    /// A `u32` companion to `pipeline_id`, derived from the same hash so it
    /// moves in lockstep with it without being separately versioned by hand.
    pub fn pipeline_version(&self) -> u32 {
        let hash = ContentHash::from_bytes(self.canonical_json().as_bytes());
        let b = hash.as_bytes();
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeaturePointerEntry {
    content_hash: String,
    pipeline_id: String,
    pipeline_version: u32,
}

/// Persisted `feature_id -> (content hash, pipeline id/version)` map, same
/// temp+rename discipline as `CheckpointPointers`.
struct FeaturePointers {
    path: PathBuf,
    entries: RwLock<HashMap<String, FeaturePointerEntry>>,
}

impl FeaturePointers {
    async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    async fn persist(&self, data: &HashMap<String, FeaturePointerEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(data)?;
        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn set(&self, feature_id: &str, pipeline_id: &str, pipeline_version: u32, hash: ContentHash) -> Result<()> {
        let mut data = self.entries.write().await;
        data.insert(
            feature_id.to_string(),
            FeaturePointerEntry { content_hash: hash.to_hex(), pipeline_id: pipeline_id.to_string(), pipeline_version },
        );
        self.persist(&data).await
    }

    async fn get(&self, feature_id: &str) -> Option<ContentHash> {
        let data = self.entries.read().await;
        data.get(feature_id).and_then(|e| ContentHash::from_hex(&e.content_hash).ok())
    }

    /// Bulk-remove every pointer belonging to a `(pipeline_id, pipeline_version)`,
    /// returning how many were dropped (spec §4.5 `invalidate`).
    async fn remove_by_pipeline(&self, pipeline_id: &str, pipeline_version: u32) -> Result<usize> {
        let mut data = self.entries.write().await;
        let before = data.len();
        data.retain(|_, e| !(e.pipeline_id == pipeline_id && e.pipeline_version == pipeline_version));
        let removed = before - data.len();
        if removed > 0 {
            self.persist(&data).await?;
        }
        Ok(removed)
    }
}

/// Flattens a finished batch into a `FeatureRecord`'s values.
///
/// A single-row batch (the common case: a pipeline that ends in an
/// aggregate or a schema projection over one logical item set) becomes a
/// `Named` map. A multi-row batch — one that still carries a time axis
/// because its last step was a rolling window or rate-of-change rather than
/// a reduction — is flattened row-major in sorted-field order into a
/// `Dense` vector instead of being silently averaged away.
fn reduce_to_values(batch: &Batch) -> FeatureValues {
    if batch.len() == 1 {
        let mut out = HashMap::new();
        for (k, v) in &batch[0] {
            if let FieldValue::Number(n) = v {
                out.insert(k.clone(), *n);
            }
        }
        return FeatureValues::Named(out);
    }
    let mut keys: BTreeSet<&String> = BTreeSet::new();
    for row in batch {
        keys.extend(row.keys());
    }
    let mut dense = Vec::with_capacity(batch.len() * keys.len());
    for row in batch {
        for key in &keys {
            dense.push(number_field(row, key).unwrap_or(0.0));
        }
    }
    FeatureValues::Dense(dense)
}

// --- Standard steps (spec §4.5) ---

struct Normalize;
impl PipelineStep for Normalize {
    fn step_id(&self) -> &'static str {
        "normalize"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        let field = required_str(params, "field", self.step_id())?.to_string();
        let method = params.get("method").and_then(Value::as_str).unwrap_or("zscore");
        let values: Vec<f64> = batch.iter().filter_map(|r| number_field(r, &field)).collect();
        if values.is_empty() {
            return Err(PulseError::SchemaMismatch(format!("field `{field}` not present in batch")));
        }
        match method {
            "zscore" => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                let std = variance.sqrt();
                for row in &mut batch {
                    if let Some(v) = number_field(row, &field) {
                        let z = if std > 0.0 { (v - mean) / std } else { 0.0 };
                        row.insert(field.clone(), FieldValue::Number(z));
                    }
                }
            }
            "minmax" => {
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let span = max - min;
                for row in &mut batch {
                    if let Some(v) = number_field(row, &field) {
                        let scaled = if span > 0.0 { (v - min) / span } else { 0.0 };
                        row.insert(field.clone(), FieldValue::Number(scaled));
                    }
                }
            }
            other => {
                return Err(PulseError::PipelineError {
                    step_id: self.step_id().to_string(),
                    cause: format!("unknown normalization method `{other}`"),
                })
            }
        }
        Ok(batch)
    }
}

struct Impute;
impl PipelineStep for Impute {
    fn step_id(&self) -> &'static str {
        "impute"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        let field = required_str(params, "field", self.step_id())?.to_string();
        let method = params.get("method").and_then(Value::as_str).unwrap_or("mean");
        match method {
            "mean" | "median" => {
                let mut known: Vec<f64> = batch.iter().filter_map(|r| number_field(r, &field)).collect();
                if known.is_empty() {
                    return Ok(batch);
                }
                let fill = if method == "mean" {
                    known.iter().sum::<f64>() / known.len() as f64
                } else {
                    known.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    known[known.len() / 2]
                };
                for row in &mut batch {
                    if number_field(row, &field).is_none() {
                        row.insert(field.clone(), FieldValue::Number(fill));
                    }
                }
            }
            "forward_fill" => {
                let mut last: Option<f64> = None;
                for row in &mut batch {
                    match number_field(row, &field) {
                        Some(v) => last = Some(v),
                        None => {
                            if let Some(v) = last {
                                row.insert(field.clone(), FieldValue::Number(v));
                            }
                        }
                    }
                }
            }
            other => {
                return Err(PulseError::PipelineError {
                    step_id: self.step_id().to_string(),
                    cause: format!("unknown imputation method `{other}`"),
                })
            }
        }
        Ok(batch)
    }
}

struct CategoricalEncode;
impl PipelineStep for CategoricalEncode {
    fn step_id(&self) -> &'static str {
        "categorical_encode"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        let field = required_str(params, "field", self.step_id())?.to_string();
        let categories: Vec<String> = match params.get("categories").and_then(Value::as_array) {
            Some(arr) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            None => {
                let mut set = BTreeSet::new();
                for row in &batch {
                    if let Some(FieldValue::Text(t)) = row.get(&field) {
                        set.insert(t.clone());
                    }
                }
                set.into_iter().collect()
            }
        };
        for row in &mut batch {
            let current = match row.remove(&field) {
                Some(FieldValue::Text(t)) => Some(t),
                Some(FieldValue::Number(n)) => Some(n.to_string()),
                None => None,
            };
            for category in &categories {
                let hit = current.as_deref() == Some(category.as_str());
                row.insert(format!("{field}={category}"), FieldValue::Number(if hit { 1.0 } else { 0.0 }));
            }
        }
        Ok(batch)
    }
}

struct RollingWindowAggregate;
impl PipelineStep for RollingWindowAggregate {
    fn step_id(&self) -> &'static str {
        "rolling_window_aggregate"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        let field = required_str(params, "field", self.step_id())?.to_string();
        let window = params.get("window").and_then(Value::as_u64).ok_or_else(|| PulseError::PipelineError {
            step_id: self.step_id().to_string(),
            cause: "missing required integer param `window`".to_string(),
        })? as usize;
        if window == 0 {
            return Err(PulseError::PipelineError {
                step_id: self.step_id().to_string(),
                cause: "`window` must be at least 1".to_string(),
            });
        }
        if batch.len() < window {
            return Err(PulseError::InsufficientData { needed: window, have: batch.len() });
        }
        let agg = params.get("agg").and_then(Value::as_str).unwrap_or("mean").to_string();
        let out_field = params
            .get("output_field")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("{field}_rolling_{agg}_{window}"));

        let raw: Vec<Option<f64>> = batch.iter().map(|r| number_field(r, &field)).collect();
        let mut results = Vec::with_capacity(batch.len());
        for i in 0..raw.len() {
            if i + 1 < window {
                results.push(None);
                continue;
            }
            let window_vals: Vec<f64> = raw[i + 1 - window..=i].iter().filter_map(|v| *v).collect();
            if window_vals.is_empty() {
                results.push(None);
                continue;
            }
            let value = match agg.as_str() {
                "sum" => window_vals.iter().sum(),
                "min" => window_vals.iter().cloned().fold(f64::INFINITY, f64::min),
                "max" => window_vals.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                _ => window_vals.iter().sum::<f64>() / window_vals.len() as f64,
            };
            results.push(Some(value));
        }
        for (row, value) in batch.iter_mut().zip(results) {
            if let Some(v) = value {
                row.insert(out_field.clone(), FieldValue::Number(v));
            }
        }
        Ok(batch)
    }
}

struct RateOfChange;
impl PipelineStep for RateOfChange {
    fn step_id(&self) -> &'static str {
        "rate_of_change"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        if batch.len() < 2 {
            return Err(PulseError::InsufficientData { needed: 2, have: batch.len() });
        }
        let field = required_str(params, "field", self.step_id())?.to_string();
        let out_field = params.get("output_field").and_then(Value::as_str).map(String::from).unwrap_or_else(|| format!("{field}_roc"));
        let mut prev: Option<f64> = None;
        for row in &mut batch {
            let cur = number_field(row, &field);
            let roc = match (prev, cur) {
                (Some(p), Some(c)) if p != 0.0 => (c - p) / p,
                _ => 0.0,
            };
            row.insert(out_field.clone(), FieldValue::Number(roc));
            if let Some(c) = cur {
                prev = Some(c);
            }
        }
        Ok(batch)
    }
}

struct LogTransform;
impl PipelineStep for LogTransform {
    fn step_id(&self) -> &'static str {
        "log_transform"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        let field = required_str(params, "field", self.step_id())?.to_string();
        let out_field = params.get("output_field").and_then(Value::as_str).map(String::from).unwrap_or_else(|| field.clone());
        for row in &mut batch {
            if let Some(v) = number_field(row, &field) {
                let safe = if v > 0.0 { v } else { f64::MIN_POSITIVE };
                row.insert(out_field.clone(), FieldValue::Number(safe.ln()));
            }
        }
        Ok(batch)
    }
}

struct SchemaProjection;
impl PipelineStep for SchemaProjection {
    fn step_id(&self) -> &'static str {
        "schema_projection"
    }
    fn step_version(&self) -> u32 {
        1
    }
    fn apply(&self, mut batch: Batch, params: &Value) -> Result<Batch> {
        let fields: Vec<String> = params
            .get("fields")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .ok_or_else(|| PulseError::SchemaMismatch("schema_projection requires a `fields` array".to_string()))?;
        for field in &fields {
            if !batch.iter().any(|row| row.contains_key(field)) {
                return Err(PulseError::SchemaMismatch(format!("projected field `{field}` is absent from every row")));
            }
        }
        for row in &mut batch {
            row.retain(|k, _| fields.contains(k));
        }
        Ok(batch)
    }
}

// --- Advanced steps (spec §4.5) ---
//
// These degrade to a lightweight deterministic approximation of the
// described technique rather than a trained model, since the Feature
// Processor has no training loop of its own to fit one — "when the
// runtime environment supports it" per spec, and here it supports the
// arithmetic approximation, not a learned one.

struct TimeFrequencyDecompose;
impl PipelineStep for TimeFrequencyDecompose {
    fn step_id(&self) -> &'static str {
        "time_frequency_decompose"
    }
    fn step_version(&self) -> u32 {
        1
    }
    /// Naive O(n^2) DFT magnitude spectrum over the whole batch window,
    /// standing in for STFT/CWT: exact for the single window this pipeline
    /// model actually has (a pipeline step sees one batch, not a stream of
    /// overlapping windows), at the cost of not scaling to long batches.
    fn apply(&self, batch: Batch, params: &Value) -> Result<Batch> {
        let field = required_str(params, "field", self.step_id())?.to_string();
        let n_bins = params.get("bins").and_then(Value::as_u64).unwrap_or(4) as usize;
        let series: Vec<f64> = batch.iter().filter_map(|r| number_field(r, &field)).collect();
        if series.len() < 2 {
            return Err(PulseError::InsufficientData { needed: 2, have: series.len() });
        }
        let n = series.len();
        let mut magnitudes = Vec::with_capacity(n_bins);
        for k in 0..n_bins.min(n) {
            let mut re = 0.0;
            let mut im = 0.0;
            for (t, value) in series.iter().enumerate() {
                let angle = -2.0 * std::f64::consts::PI * (k as f64) * (t as f64) / (n as f64);
                re += value * angle.cos();
                im += value * angle.sin();
            }
            magnitudes.push((re * re + im * im).sqrt() / n as f64);
        }
        let mut out_row = Row::new();
        for (k, magnitude) in magnitudes.into_iter().enumerate() {
            out_row.insert(format!("{field}_freq_{k}"), FieldValue::Number(magnitude));
        }
        Ok(vec![out_row])
    }
}

struct ComovementGraph;
impl PipelineStep for ComovementGraph {
    fn step_id(&self) -> &'static str {
        "comovement_graph"
    }
    fn step_version(&self) -> u32 {
        1
    }
    /// Average pairwise Pearson correlation across `fields` over the
    /// window, a scalar summary of the co-movement graph's edge weights
    /// rather than the full graph.
    fn apply(&self, batch: Batch, params: &Value) -> Result<Batch> {
        let fields: Vec<String> = params
            .get("fields")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .ok_or_else(|| PulseError::SchemaMismatch("comovement_graph requires a `fields` array".to_string()))?;
        if fields.len() < 2 {
            return Err(PulseError::SchemaMismatch("comovement_graph requires at least 2 fields".to_string()));
        }
        if batch.len() < 2 {
            return Err(PulseError::InsufficientData { needed: 2, have: batch.len() });
        }
        let series: Vec<Vec<f64>> =
            fields.iter().map(|f| batch.iter().filter_map(|r| number_field(r, f)).collect()).collect();

        let mut correlations = Vec::new();
        for i in 0..fields.len() {
            for j in (i + 1)..fields.len() {
                if let Some(corr) = pearson(&series[i], &series[j]) {
                    correlations.push(corr);
                }
            }
        }
        let mean_corr = if correlations.is_empty() { 0.0 } else { correlations.iter().sum::<f64>() / correlations.len() as f64 };
        let mut out_row = Row::new();
        out_row.insert("comovement_mean_correlation".to_string(), FieldValue::Number(mean_corr));
        Ok(vec![out_row])
    }
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let a = &a[..n];
    let b = &b[..n];
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return Some(0.0);
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

struct SelfSupervisedEmbedding;
impl PipelineStep for SelfSupervisedEmbedding {
    fn step_id(&self) -> &'static str {
        "self_supervised_embedding"
    }
    fn step_version(&self) -> u32 {
        1
    }
    /// Deterministic stand-in for an autoencoder-like reducer: the leading
    /// principal component of `fields` via power iteration on the
    /// covariance matrix, computed fresh per call rather than fit once and
    /// reused, so this stays a pure `(batch, params) -> batch` function.
    fn apply(&self, batch: Batch, params: &Value) -> Result<Batch> {
        let fields: Vec<String> = params
            .get("fields")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .ok_or_else(|| PulseError::SchemaMismatch("self_supervised_embedding requires a `fields` array".to_string()))?;
        if fields.is_empty() {
            return Err(PulseError::SchemaMismatch("self_supervised_embedding requires at least 1 field".to_string()));
        }
        let dims = fields.len();
        let rows: Vec<Vec<f64>> = batch.iter().map(|r| fields.iter().map(|f| number_field(r, f).unwrap_or(0.0)).collect()).collect();
        if rows.is_empty() {
            return Err(PulseError::InsufficientData { needed: 1, have: 0 });
        }
        let means: Vec<f64> = (0..dims).map(|d| rows.iter().map(|r| r[d]).sum::<f64>() / rows.len() as f64).collect();
        let centered: Vec<Vec<f64>> = rows.iter().map(|r| r.iter().zip(&means).map(|(v, m)| v - m).collect()).collect();

        let mut component = vec![1.0 / (dims as f64).sqrt(); dims];
        for _ in 0..32 {
            let mut next = vec![0.0; dims];
            for row in &centered {
                let projection: f64 = row.iter().zip(&component).map(|(v, c)| v * c).sum();
                for d in 0..dims {
                    next[d] += projection * row[d];
                }
            }
            let norm = next.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm <= f64::EPSILON {
                break;
            }
            component = next.into_iter().map(|v| v / norm).collect();
        }

        let mut out_row = Row::new();
        for (projection_index, row) in centered.iter().enumerate() {
            let score: f64 = row.iter().zip(&component).map(|(v, c)| v * c).sum();
            out_row.insert(format!("embedding_{projection_index}"), FieldValue::Number(score));
        }
        Ok(vec![out_row])
    }
}

fn standard_steps() -> Vec<Arc<dyn PipelineStep>> {
    vec![
        Arc::new(Normalize),
        Arc::new(Impute),
        Arc::new(CategoricalEncode),
        Arc::new(RollingWindowAggregate),
        Arc::new(RateOfChange),
        Arc::new(LogTransform),
        Arc::new(SchemaProjection),
        Arc::new(TimeFrequencyDecompose),
        Arc::new(ComovementGraph),
        Arc::new(SelfSupervisedEmbedding),
    ]
}

/// Turns raw items into cached, content-addressed feature records (spec
/// §4.5). One processor instance owns its own content-addressed backend
/// (separate from the main item store's, though typically rooted alongside
/// it) and a registry of the steps it's willing to run.
pub struct FeatureProcessor {
    backend: Arc<dyn BlobBackend>,
    pointers: FeaturePointers,
    steps: HashMap<&'static str, Arc<dyn PipelineStep>>,
}

impl FeatureProcessor {
    pub async fn open(backend: Arc<dyn BlobBackend>, pointers_path: impl Into<PathBuf>) -> Result<Self> {
        let pointers = FeaturePointers::open(pointers_path).await?;
        let steps = standard_steps().into_iter().map(|s| (s.step_id(), s)).collect();
        Ok(Self { backend, pointers, steps })
    }

    /// Register an additional or overriding step implementation.
    pub fn register_step(&mut self, step: Arc<dyn PipelineStep>) {
        self.steps.insert(step.step_id(), step);
    }

    /// Run `pipeline` over `item_ids`, returning the resulting
    /// `feature_id`. A cache hit (same item set, same pipeline) short-
    /// circuits before touching the store.
    pub async fn process(&self, store: &Store, item_ids: Vec<ItemId>, pipeline: &Pipeline) -> Result<String> {
        let pipeline_id = pipeline.pipeline_id();
        let pipeline_version = pipeline.pipeline_version();
        let normalized_params = pipeline.canonical_json();
        let feature_id = ContentHash::for_feature(&item_ids, &pipeline_id, pipeline_version, &normalized_params).to_hex();

        if self.pointers.get(&feature_id).await.is_some() {
            return Ok(feature_id);
        }

        let mut batch: Batch = Vec::with_capacity(item_ids.len());
        for item_id in &item_ids {
            let item = store.get_item(item_id).await?;
            batch.push(row_from_item(&item));
        }

        for step_spec in &pipeline.steps {
            let step = self.steps.get(step_spec.step_id.as_str()).ok_or_else(|| PulseError::PipelineError {
                step_id: step_spec.step_id.clone(),
                cause: "no step registered with this id".to_string(),
            })?;
            if step.step_version() != step_spec.step_version {
                return Err(PulseError::PipelineError {
                    step_id: step_spec.step_id.clone(),
                    cause: format!("registered step is version {}, pipeline requests {}", step.step_version(), step_spec.step_version),
                });
            }
            batch = step.apply(batch, &step_spec.params).map_err(|err| match err {
                PulseError::PipelineError { .. } | PulseError::InsufficientData { .. } | PulseError::SchemaMismatch(_) => err,
                other => PulseError::PipelineError { step_id: step_spec.step_id.clone(), cause: other.to_string() },
            })?;
        }

        let record = FeatureRecord {
            feature_id: feature_id.clone(),
            source_item_ids: item_ids,
            pipeline_id: pipeline_id.clone(),
            pipeline_version,
            values: reduce_to_values(&batch),
            created_at: Utc::now(),
        };
        let bytes = bincode::serialize(&record).map_err(|e| PulseError::SerializationError(e.to_string()))?;
        let hash = self.backend.put(&bytes).await?;
        self.pointers.set(&feature_id, &pipeline_id, pipeline_version, hash).await?;
        Ok(feature_id)
    }

    pub async fn get(&self, feature_id: &str) -> Result<FeatureRecord> {
        let hash = self.pointers.get(feature_id).await.ok_or_else(|| PulseError::NotFound(feature_id.to_string()))?;
        let bytes = self.backend.get(&hash).await?;
        bincode::deserialize(&bytes).map_err(|e| PulseError::SerializationError(e.to_string()))
    }

    /// Bulk-invalidate every cached feature produced by `(pipeline_id,
    /// pipeline_version)`, returning the number of entries dropped.
    pub async fn invalidate(&self, pipeline_id: &str, pipeline_version: u32) -> Result<usize> {
        self.pointers.remove_by_pipeline(pipeline_id, pipeline_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::FilesystemBackend;
    use crate::store::{Store, StoreConfig};
    use crate::types::ItemMetadata;

    async fn harness() -> (tempfile::TempDir, Store, FeatureProcessor) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig { root: dir.path().join("store"), ..StoreConfig::default() }).await.unwrap();
        let backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(dir.path().join("features")));
        let processor = FeatureProcessor::open(backend, dir.path().join("features.ptr")).await.unwrap();
        (dir, store, processor)
    }

    fn item_metadata(value: f64) -> ItemMetadata {
        let mut metadata = ItemMetadata::default();
        metadata.canonical_fields.insert("price".to_string(), value.to_string());
        metadata
    }

    #[tokio::test]
    async fn process_is_idempotent_and_cache_hits_return_the_same_id() {
        let (_dir, store, processor) = harness().await;
        let mut ids = Vec::new();
        for value in [1.0, 2.0, 3.0] {
            ids.push(store.put_item("ds", "test", value.to_string().into_bytes(), item_metadata(value)).await.unwrap());
        }
        let pipeline = Pipeline::new(vec![PipelineStepSpec {
            step_id: "normalize".to_string(),
            step_version: 1,
            params: serde_json::json!({"field": "price", "method": "zscore"}),
        }]);

        let first = processor.process(&store, ids.clone(), &pipeline).await.unwrap();
        let second = processor.process(&store, ids, &pipeline).await.unwrap();
        assert_eq!(first, second);

        let record = processor.get(&first).await.unwrap();
        assert_eq!(record.pipeline_id, pipeline.pipeline_id());
    }

    #[tokio::test]
    async fn unknown_step_id_raises_pipeline_error() {
        let (_dir, store, processor) = harness().await;
        let id = store.put_item("ds", "test", b"x".to_vec(), item_metadata(1.0)).await.unwrap();
        let pipeline = Pipeline::new(vec![PipelineStepSpec { step_id: "does_not_exist".to_string(), step_version: 1, params: Value::Null }]);
        let err = processor.process(&store, vec![id], &pipeline).await.unwrap_err();
        assert!(matches!(err, PulseError::PipelineError { .. }));
    }

    #[tokio::test]
    async fn rolling_window_without_enough_history_is_insufficient_data() {
        let (_dir, store, processor) = harness().await;
        let id = store.put_item("ds", "test", b"x".to_vec(), item_metadata(1.0)).await.unwrap();
        let pipeline = Pipeline::new(vec![PipelineStepSpec {
            step_id: "rolling_window_aggregate".to_string(),
            step_version: 1,
            params: serde_json::json!({"field": "price", "window": 5, "agg": "mean"}),
        }]);
        let err = processor.process(&store, vec![id], &pipeline).await.unwrap_err();
        assert!(matches!(err, PulseError::InsufficientData { needed: 5, have: 1 }));
    }

    #[tokio::test]
    async fn schema_projection_missing_field_is_schema_mismatch() {
        let (_dir, store, processor) = harness().await;
        let id = store.put_item("ds", "test", b"x".to_vec(), item_metadata(1.0)).await.unwrap();
        let pipeline = Pipeline::new(vec![PipelineStepSpec {
            step_id: "schema_projection".to_string(),
            step_version: 1,
            params: serde_json::json!({"fields": ["does_not_exist"]}),
        }]);
        let err = processor.process(&store, vec![id], &pipeline).await.unwrap_err();
        assert!(matches!(err, PulseError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn invalidate_removes_entries_for_that_pipeline_only() {
        let (_dir, store, processor) = harness().await;
        let id_a = store.put_item("ds", "test", b"a".to_vec(), item_metadata(1.0)).await.unwrap();
        let id_b = store.put_item("ds", "test", b"b".to_vec(), item_metadata(2.0)).await.unwrap();

        let pipeline_a = Pipeline::new(vec![PipelineStepSpec {
            step_id: "normalize".to_string(),
            step_version: 1,
            params: serde_json::json!({"field": "price", "method": "minmax"}),
        }]);
        let pipeline_b = Pipeline::new(vec![PipelineStepSpec {
            step_id: "log_transform".to_string(),
            step_version: 1,
            params: serde_json::json!({"field": "price"}),
        }]);

        let feature_a = processor.process(&store, vec![id_a], &pipeline_a).await.unwrap();
        let feature_b = processor.process(&store, vec![id_b], &pipeline_b).await.unwrap();

        let removed = processor.invalidate(&pipeline_a.pipeline_id(), pipeline_a.pipeline_version()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(processor.get(&feature_a).await.is_err());
        assert!(processor.get(&feature_b).await.is_ok());
    }

    #[tokio::test]
    async fn rate_of_change_requires_at_least_two_rows() {
        let (_dir, store, processor) = harness().await;
        let id = store.put_item("ds", "test", b"x".to_vec(), item_metadata(1.0)).await.unwrap();
        let pipeline = Pipeline::new(vec![PipelineStepSpec {
            step_id: "rate_of_change".to_string(),
            step_version: 1,
            params: serde_json::json!({"field": "price"}),
        }]);
        let err = processor.process(&store, vec![id], &pipeline).await.unwrap_err();
        assert!(matches!(err, PulseError::InsufficientData { needed: 2, .. }));
    }
}
