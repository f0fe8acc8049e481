//! Shared data model for the Recursive Training Core.
//!
//! These types are the vocabulary every component talks in; see spec §3.
//! All identifiers are opaque stable strings unless noted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content_hash::ContentHash;

/// Opaque stable identifier for an [`Item`].
pub type ItemId = String;
/// Opaque stable identifier for a [`Dataset`].
pub type DatasetId = String;
/// Opaque stable identifier for a run.
pub type RunId = String;

/// An immutable unit of ingested data.
///
/// `item_id` is derived from a content hash over `payload` and
/// `metadata.canonical_fields` (see [`crate::content_hash`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: ItemId,
    pub dataset_id: DatasetId,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub metadata: ItemMetadata,
}

/// Metadata carried alongside an item's payload.
///
/// `canonical_fields` participates in `item_id` derivation; `extra` does not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub canonical_fields: HashMap<String, String>,
    pub extra: HashMap<String, String>,
}

impl Item {
    /// Build an item, deriving its `item_id` from `payload` and
    /// `metadata.canonical_fields`.
    pub fn new(dataset_id: DatasetId, source: String, payload: Vec<u8>, metadata: ItemMetadata) -> Self {
        let item_id = ContentHash::for_item(&metadata, &payload).to_string();
        Self {
            item_id,
            dataset_id,
            source,
            created_at: Utc::now(),
            payload,
            metadata,
        }
    }
}

/// Compression scheme for a dataset's columnar payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Snappy,
    Zstd,
}

/// A named, versioned grouping of items.
///
/// New versions are created on any update; prior versions remain
/// addressable (dataset versions are monotonically increasing and, once
/// published, immutable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: DatasetId,
    pub name: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub item_ids: Vec<ItemId>,
    pub schema_ref: String,
    pub compression: Compression,
}

/// One entry of the persistent [`crate::store::index::StoreIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub dataset_id: DatasetId,
    pub version: u64,
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

/// A derived, cacheable feature vector.
///
/// `feature_id` = hash(`source_item_ids, pipeline_id, pipeline_version,
/// normalized_params`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub feature_id: String,
    pub source_item_ids: Vec<ItemId>,
    pub pipeline_id: String,
    pub pipeline_version: u32,
    pub values: FeatureValues,
    pub created_at: DateTime<Utc>,
}

/// The computed values of a [`FeatureRecord`]: either a dense numeric
/// vector or a named map, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValues {
    Dense(Vec<f64>),
    Named(HashMap<String, f64>),
}

/// Per-entity Bayesian reliability state.
///
/// Invariant: `alpha >= prior_alpha >= 1`, `beta >= prior_beta >= 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntity {
    pub entity_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub prior_alpha: f64,
    pub prior_beta: f64,
    pub sample_count: u64,
    pub last_update_at: DateTime<Utc>,
}

impl TrustEntity {
    /// Posterior mean, `alpha / (alpha + beta)`.
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

/// A single weighted observation to apply to a [`TrustEntity`].
///
/// `successes + failures` must be `> 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustUpdate {
    pub entity_id: String,
    pub successes: f64,
    pub failures: f64,
    pub weight: f64,
}

impl TrustUpdate {
    pub fn new(entity_id: impl Into<String>, successes: f64, failures: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            successes,
            failures,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// An append-only training metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub metric_id: String,
    pub run_id: RunId,
    pub name: String,
    pub value: f64,
    pub tags: HashMap<String, String>,
    pub at: DateTime<Utc>,
}

/// An append-only cost event counted toward a run's budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub run_id: RunId,
    pub category: String,
    pub units: f64,
    pub cost: f64,
    pub at: DateTime<Utc>,
}

/// A durable snapshot sufficient to resume a run without double-applying
/// updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub batch_index: u64,
    pub store_versions_consumed: HashMap<DatasetId, u64>,
    pub trust_snapshot_id: String,
    pub metrics_watermark: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

/// A detected statistical regime change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeEvent {
    pub event_id: String,
    pub detected_at: DateTime<Utc>,
    pub signals: HashMap<String, f64>,
    pub kind: String,
    pub reference_window: (DateTime<Utc>, DateTime<Utc>),
    pub current_window: (DateTime<Utc>, DateTime<Utc>),
}

/// A rule as seen by a worker enumerating what fired during a batch (spec
/// §6 Rule repository). Read-only from the core's perspective; the
/// repository backing it lives in host-system code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub description: String,
    pub definition: serde_json::Value,
}

/// The subset of a [`Rule`] returned by a repository listing, cheap enough
/// to enumerate in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSummary {
    pub rule_id: String,
    pub description: String,
}

/// A handle to a trained artifact persisted in an external model registry
/// (spec §6 Model registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: RunId,
    pub name: String,
    pub content_hash: String,
}

/// A source adapter's description of the shape of items it produces,
/// checked against ingested items before they are stored (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub schema_ref: String,
    /// JSON Schema the item payload (decoded as JSON) must validate
    /// against.
    pub json_schema: serde_json::Value,
    /// Stable identifiers of the variables this schema currently describes.
    /// A name appearing here that the Ingestion Manager hasn't seen before
    /// for this adapter is a newly discovered variable (spec §4.6): its
    /// first fetch bypasses `max_poll_frequency` once, independent of the
    /// adapter's own last-poll spacing.
    #[serde(default)]
    pub variables: Vec<String>,
}

/// An adapter's a-priori estimate of what a `fetch` call will cost, used by
/// the Cost Controller to admit or defer ingestion before it runs (spec
/// §4.6, §4.11).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostEstimate {
    pub api_calls: f64,
    pub compute_units: f64,
}

/// How residual-reduction credit is attributed to rules that fired in a
/// time step. Default is `Binary` (see `DESIGN.md` open-question log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMode {
    #[default]
    Binary,
    Proportional,
}

/// Retry policy shared by the Coordinator and Ingestion Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub total_deadline_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 10_000,
            total_deadline_ms: 60_000,
        }
    }
}

/// A cost envelope across compute, storage, and network categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub api_calls: f64,
    pub compute_units: f64,
    pub storage_ops: f64,
}

/// Specification of one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: RunId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub variables: Vec<String>,
    pub batch_size: chrono::Duration,
    pub concurrency: usize,
    pub budget: Budget,
    pub retry_policy: RetryPolicy,
    pub pipeline_id: String,
    pub attribution_mode: AttributionMode,
    /// If set, one non-retriable batch failure aborts the whole run instead
    /// of letting the remaining batches proceed (spec §4.9).
    #[serde(default)]
    pub fail_fast: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_is_derived_from_payload_and_canonical_fields() {
        let meta = ItemMetadata::default();
        let a = Item::new("ds".into(), "src".into(), b"payload".to_vec(), meta.clone());
        let b = Item::new("ds2".into(), "other-src".into(), b"payload".to_vec(), meta);
        // Same payload + canonical fields => same item_id, regardless of source/dataset.
        assert_eq!(a.item_id, b.item_id);
    }

    #[test]
    fn trust_entity_mean_matches_beta_mean() {
        let e = TrustEntity {
            entity_id: "r_a".into(),
            alpha: 5.0,
            beta: 3.0,
            prior_alpha: 1.0,
            prior_beta: 1.0,
            sample_count: 6,
            last_update_at: Utc::now(),
        };
        assert!((e.mean() - 0.625).abs() < 1e-9);
    }
}
