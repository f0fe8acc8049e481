//! Config Manager (spec §4.12): a layered, hot-reloadable configuration
//! tree.
//!
//! A typed-tree-plus-`Default` config struct with an uppercase-constant
//! environment-variable convention. Hot-reload notification uses
//! `tokio::sync::watch`, matching the suspension-point-only signaling the
//! rest of the crate uses for cooperative state changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::coordinator::BackpressureConfig;
use crate::error::{PulseError, Result};
use crate::metrics_collector::CollectorConfig;
use crate::store::StoreConfig;
use crate::trust::TrustPrior;
use crate::trust_buffer::TrustBufferConfig;
use crate::types::{Budget, RetryPolicy};

/// Storage layout and size limits (mirrors [`StoreConfig`], kept separate
/// so this tree stays `serde`-able independent of the Store's own type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    pub root: PathBuf,
    pub max_item_size_bytes: Option<u64>,
    pub prefetch_depth: usize,
    pub local_cache_entries: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        let d = StoreConfig::default();
        Self {
            root: d.root,
            max_item_size_bytes: d.max_item_size_bytes,
            prefetch_depth: d.prefetch_depth,
            local_cache_entries: d.local_cache_entries,
        }
    }
}

impl StoreSection {
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            root: self.root.clone(),
            max_item_size_bytes: self.max_item_size_bytes,
            prefetch_depth: self.prefetch_depth,
            local_cache_entries: self.local_cache_entries,
        }
    }
}

/// Trust Update Buffer thresholds, expressed with millisecond durations so
/// the section round-trips through TOML without a custom serde adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustBufferSection {
    pub flush_threshold: usize,
    pub max_linger_ms: u64,
    pub enqueue_timeout_ms: u64,
    pub max_pending: usize,
}

impl Default for TrustBufferSection {
    fn default() -> Self {
        let d = TrustBufferConfig::default();
        Self {
            flush_threshold: d.flush_threshold,
            max_linger_ms: d.max_linger.as_millis() as u64,
            enqueue_timeout_ms: d.enqueue_timeout.as_millis() as u64,
            max_pending: d.max_pending,
        }
    }
}

impl TrustBufferSection {
    pub fn to_buffer_config(&self) -> TrustBufferConfig {
        TrustBufferConfig {
            flush_threshold: self.flush_threshold,
            max_linger: Duration::from_millis(self.max_linger_ms),
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            max_pending: self.max_pending,
        }
    }
}

/// Async Metrics Collector batching/retry thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsCollectorSection {
    pub max_batch_size: usize,
    pub max_linger_ms: u64,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub shutdown_drain_deadline_ms: u64,
}

impl Default for MetricsCollectorSection {
    fn default() -> Self {
        let d = CollectorConfig::default();
        Self {
            max_batch_size: d.max_batch_size,
            max_linger_ms: d.max_linger.as_millis() as u64,
            queue_capacity: d.queue_capacity,
            max_retries: d.max_retries,
            base_backoff_ms: d.base_backoff_ms,
            max_backoff_ms: d.max_backoff_ms,
            shutdown_drain_deadline_ms: d.shutdown_drain_deadline.as_millis() as u64,
        }
    }
}

impl MetricsCollectorSection {
    pub fn to_collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            max_batch_size: self.max_batch_size,
            max_linger: Duration::from_millis(self.max_linger_ms),
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            base_backoff_ms: self.base_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            shutdown_drain_deadline: Duration::from_millis(self.shutdown_drain_deadline_ms),
        }
    }
}

/// Coordinator backpressure hysteresis and checkpoint-age orphan cutoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    pub high_water_mark: f64,
    pub low_water_mark: f64,
    pub poll_interval_ms: u64,
    pub max_checkpoint_age_secs: i64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            high_water_mark: 0.8,
            low_water_mark: 0.5,
            poll_interval_ms: 20,
            max_checkpoint_age_secs: 3600,
        }
    }
}

impl CoordinatorSection {
    pub fn to_backpressure_config(&self) -> BackpressureConfig {
        BackpressureConfig {
            high_water_mark: self.high_water_mark,
            low_water_mark: self.low_water_mark,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn max_checkpoint_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_checkpoint_age_secs)
    }
}

/// `tracing`/`prometheus` setup (spec §A.2 of the ambient stack).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"pulse_core=info"`.
    pub log_filter: String,
    pub json: bool,
    pub metrics_enabled: bool,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_filter: "pulse_core=info".to_string(),
            json: false,
            metrics_enabled: true,
        }
    }
}

/// The full configuration tree (spec §4.12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    pub store: StoreSection,
    #[serde(default)]
    pub trust_prior: TrustPrior,
    pub trust_buffer: TrustBufferSection,
    pub metrics_collector: MetricsCollectorSection,
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub default_budget: Budget,
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    pub observability: ObservabilitySection,
}

impl Default for Budget {
    fn default() -> Self {
        Self { api_calls: 10_000.0, compute_units: 10_000.0, storage_ops: 10_000.0 }
    }
}

impl PulseConfig {
    /// Validation run on every load (spec §4.12 "invalid configurations are
    /// rejected atomically").
    fn validate(&self) -> Result<()> {
        if self.coordinator.low_water_mark > self.coordinator.high_water_mark {
            return Err(PulseError::InvalidConfig(format!(
                "coordinator.low_water_mark ({}) must not exceed coordinator.high_water_mark ({})",
                self.coordinator.low_water_mark, self.coordinator.high_water_mark
            )));
        }
        if !(0.0..=1.0).contains(&self.coordinator.high_water_mark) || !(0.0..=1.0).contains(&self.coordinator.low_water_mark) {
            return Err(PulseError::InvalidConfig("coordinator water marks must be in [0, 1]".to_string()));
        }
        if self.trust_buffer.max_pending == 0 {
            return Err(PulseError::InvalidConfig("trust_buffer.max_pending must be > 0".to_string()));
        }
        if self.default_budget.api_calls < 0.0 || self.default_budget.compute_units < 0.0 || self.default_budget.storage_ops < 0.0 {
            return Err(PulseError::InvalidConfig("default_budget entries must be non-negative".to_string()));
        }
        if self.default_retry_policy.max_attempts == 0 {
            return Err(PulseError::InvalidConfig("default_retry_policy.max_attempts must be > 0".to_string()));
        }
        Ok(())
    }

    /// Apply the uppercase/dot-to-underscore environment layer, e.g.
    /// `store.path` ← `PULSE_STORE_PATH` (spec §6 "Configuration").
    fn apply_env(&mut self) {
        if let Some(v) = env_var("PULSE_STORE_ROOT") {
            self.store.root = PathBuf::from(v);
        }
        if let Some(v) = env_parse("PULSE_STORE_PREFETCH_DEPTH") {
            self.store.prefetch_depth = v;
        }
        if let Some(v) = env_parse("PULSE_STORE_LOCAL_CACHE_ENTRIES") {
            self.store.local_cache_entries = v;
        }
        if let Some(v) = env_parse("PULSE_TRUST_PRIOR_ALPHA") {
            self.trust_prior.alpha = v;
        }
        if let Some(v) = env_parse("PULSE_TRUST_PRIOR_BETA") {
            self.trust_prior.beta = v;
        }
        if let Some(v) = env_parse("PULSE_COORDINATOR_HIGH_WATER_MARK") {
            self.coordinator.high_water_mark = v;
        }
        if let Some(v) = env_parse("PULSE_COORDINATOR_LOW_WATER_MARK") {
            self.coordinator.low_water_mark = v;
        }
        if let Some(v) = env_parse("PULSE_DEFAULT_BUDGET_COMPUTE_UNITS") {
            self.default_budget.compute_units = v;
        }
        if let Some(v) = env_parse("PULSE_DEFAULT_BUDGET_API_CALLS") {
            self.default_budget.api_calls = v;
        }
        if let Some(v) = env_parse("PULSE_DEFAULT_BUDGET_STORAGE_OPS") {
            self.default_budget.storage_ops = v;
        }
        if let Some(v) = env_var("PULSE_OBSERVABILITY_LOG_FILTER") {
            self.observability.log_filter = v;
        }
        if let Some(v) = env_bool("PULSE_OBSERVABILITY_JSON") {
            self.observability.json = v;
        }
        if let Some(v) = env_bool("PULSE_OBSERVABILITY_METRICS_ENABLED") {
            self.observability.metrics_enabled = v;
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_var(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Runtime overrides applied last, highest-precedence layer (spec §4.12).
/// A sparse partial config: `None` fields leave the lower layers' value in
/// place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub store_root: Option<PathBuf>,
    pub default_budget: Option<Budget>,
    pub coordinator_high_water_mark: Option<f64>,
    pub coordinator_low_water_mark: Option<f64>,
}

impl ConfigOverrides {
    fn apply_onto(&self, config: &mut PulseConfig) {
        if let Some(root) = &self.store_root {
            config.store.root = root.clone();
        }
        if let Some(budget) = &self.default_budget {
            config.default_budget = budget.clone();
        }
        if let Some(v) = self.coordinator_high_water_mark {
            config.coordinator.high_water_mark = v;
        }
        if let Some(v) = self.coordinator_low_water_mark {
            config.coordinator.low_water_mark = v;
        }
    }
}

/// A live subscription to configuration changes. Each subscriber keeps its
/// own last-accepted config; if its validation closure refuses a reload,
/// the subscriber's view simply does not advance while everyone else's
/// still can (spec §4.12 "refusal leaves the previous configuration in
/// force for that subscriber").
pub struct ConfigSubscription {
    rx: watch::Receiver<Arc<PulseConfig>>,
    current: Arc<PulseConfig>,
}

impl ConfigSubscription {
    /// This subscriber's last-accepted configuration.
    pub fn current(&self) -> Arc<PulseConfig> {
        self.current.clone()
    }

    /// Wait for the next published reload and offer it to `accept`. On
    /// `Ok`, the subscription's view advances to the new config and it is
    /// returned. On `Err`, the subscription keeps its previous config and
    /// the refusal is surfaced to the caller. Returns `Ok(None)` if the
    /// manager has been dropped.
    pub async fn poll_reload(&mut self, accept: impl FnOnce(&PulseConfig) -> Result<()>) -> Result<Option<Arc<PulseConfig>>> {
        if self.rx.changed().await.is_err() {
            return Ok(None);
        }
        let candidate = self.rx.borrow_and_update().clone();
        accept(&candidate)?;
        self.current = candidate.clone();
        Ok(Some(candidate))
    }
}

/// Loads, validates, and hot-reloads [`PulseConfig`] (spec §4.12).
pub struct ConfigManager {
    current: RwLock<Arc<PulseConfig>>,
    tx: watch::Sender<Arc<PulseConfig>>,
}

impl ConfigManager {
    /// Build the layered config (defaults → file → env → overrides),
    /// validate it, and construct a manager around it. No partial state is
    /// ever visible: `build` either returns a fully valid tree or an error.
    pub fn load(file_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let config = Self::build(file_path, &overrides)?;
        let arc = Arc::new(config);
        let (tx, _rx) = watch::channel(arc.clone());
        Ok(Self { current: RwLock::new(arc), tx })
    }

    fn build(file_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<PulseConfig> {
        let mut config = PulseConfig::default();
        if let Some(path) = file_path {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                let file_config: PulseConfig = toml::from_str(&text).map_err(|e| PulseError::InvalidConfig(e.to_string()))?;
                config = file_config;
            }
        }
        config.apply_env();
        overrides.apply_onto(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// The currently active configuration.
    pub fn current(&self) -> Arc<PulseConfig> {
        self.current.read().clone()
    }

    /// Re-run the layered load and, if it validates, publish it to every
    /// subscriber. Atomic: a failed reload leaves `current()` untouched.
    pub fn reload(&self, file_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Arc<PulseConfig>> {
        let next = Self::build(file_path, &overrides)?;
        let arc = Arc::new(next);
        *self.current.write() = arc.clone();
        // No active receivers is not an error; subscribers may come and go.
        let _ = self.tx.send(arc.clone());
        Ok(arc)
    }

    /// Subscribe to future reloads, starting from the manager's current
    /// config.
    pub fn subscribe(&self) -> ConfigSubscription {
        ConfigSubscription { rx: self.tx.subscribe(), current: self.current() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PulseConfig::default().validate().unwrap();
    }

    #[test]
    fn load_serialize_round_trip_matches() {
        let config = PulseConfig::default();
        let text = toml::to_string(&config).unwrap();
        let round_tripped: PulseConfig = toml::from_str(&text).unwrap();
        assert_eq!(round_tripped.coordinator.high_water_mark, config.coordinator.high_water_mark);
        assert_eq!(round_tripped.store.prefetch_depth, config.store.prefetch_depth);
    }

    #[test]
    fn water_mark_inversion_is_rejected() {
        let mut config = PulseConfig::default();
        config.coordinator.low_water_mark = 0.9;
        config.coordinator.high_water_mark = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_layer_overrides_file_and_defaults() {
        std::env::set_var("PULSE_COORDINATOR_HIGH_WATER_MARK", "0.42");
        let manager = ConfigManager::load(None, ConfigOverrides::default()).unwrap();
        assert!((manager.current().coordinator.high_water_mark - 0.42).abs() < 1e-9);
        std::env::remove_var("PULSE_COORDINATOR_HIGH_WATER_MARK");
    }

    #[test]
    fn runtime_overrides_beat_every_other_layer() {
        std::env::set_var("PULSE_COORDINATOR_HIGH_WATER_MARK", "0.42");
        let overrides = ConfigOverrides { coordinator_high_water_mark: Some(0.77), ..Default::default() };
        let manager = ConfigManager::load(None, overrides).unwrap();
        assert!((manager.current().coordinator.high_water_mark - 0.77).abs() < 1e-9);
        std::env::remove_var("PULSE_COORDINATOR_HIGH_WATER_MARK");
    }

    #[tokio::test]
    async fn subscriber_refusal_keeps_previous_config() {
        let manager = ConfigManager::load(None, ConfigOverrides::default()).unwrap();
        let mut sub = manager.subscribe();
        let before = sub.current();

        let overrides = ConfigOverrides { coordinator_low_water_mark: Some(0.95), ..Default::default() };
        // Deliberately invalid: low > high, so the reload itself is rejected
        // and current() never advances.
        let mut bad_overrides = overrides.clone();
        bad_overrides.coordinator_high_water_mark = Some(0.1);
        assert!(manager.reload(None, bad_overrides).is_err());
        assert_eq!(manager.current().coordinator.low_water_mark, before.coordinator.low_water_mark);

        // A valid reload publishes, but this subscriber refuses to accept it.
        let valid_overrides = ConfigOverrides { coordinator_high_water_mark: Some(0.9), coordinator_low_water_mark: Some(0.6), ..Default::default() };
        manager.reload(None, valid_overrides).unwrap();
        let result = sub.poll_reload(|_candidate| Err(PulseError::InvalidConfig("refused by test subscriber".to_string()))).await;
        assert!(result.is_err());
        assert_eq!(sub.current().coordinator.high_water_mark, before.coordinator.high_water_mark);
    }

    #[tokio::test]
    async fn subscriber_accepts_valid_reload() {
        let manager = ConfigManager::load(None, ConfigOverrides::default()).unwrap();
        let mut sub = manager.subscribe();

        let overrides = ConfigOverrides { coordinator_high_water_mark: Some(0.9), coordinator_low_water_mark: Some(0.6), ..Default::default() };
        manager.reload(None, overrides).unwrap();
        let result = sub.poll_reload(|_candidate| Ok(())).await.unwrap();
        assert!(result.is_some());
        assert!((sub.current().coordinator.high_water_mark - 0.9).abs() < 1e-9);
    }
}
