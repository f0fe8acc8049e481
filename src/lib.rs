//! Pulse Recursive Training Core: retrodiction, trust, and drift-aware
//! training for Pulse forecasting models.
//!
//! `PulseContext` is the crate's one explicitly constructed application
//! context, replacing dynamic-plugin/global-singleton patterns (spec §9)
//! with an explicit service graph: every shared service is built once,
//! in a fixed order, and handed out as `Arc`s.

pub mod adapters;
pub mod classify;
pub mod config;
pub mod content_hash;
pub mod coordinator;
pub mod drift;
pub mod error;
pub mod feature;
pub mod ingestion;
pub mod metrics_collector;
pub mod metrics_store;
pub mod observability;
pub mod process;
pub mod retrodiction;
pub mod store;
pub mod trust;
pub mod trust_buffer;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;

use config::{ConfigManager, ConfigOverrides};
use coordinator::{Coordinator, CoordinatorConfig};
use error::Result;
use feature::FeatureProcessor;
use metrics_collector::MetricsCollector;
use metrics_store::MetricsStore;
use process::{CostController, ProcessRegistry};
use retrodiction::RetrodictionWorker;
use store::backend::{BlobBackend, FilesystemBackend};
use store::Store;
use trust::TrustTracker;
use trust_buffer::TrustUpdateBuffer;

/// Every shared service the core needs, constructed once in the
/// init order spec §9 prescribes: Config → Store → Trust Tracker →
/// Metrics Store → Collector → Registry → Coordinator.
pub struct PulseContext {
    pub config: Arc<ConfigManager>,
    pub store: Arc<Store>,
    pub trust_tracker: Arc<TrustTracker>,
    pub trust_buffer: Arc<TrustUpdateBuffer>,
    pub metrics_store: Arc<MetricsStore>,
    pub metrics_collector: Arc<MetricsCollector>,
    pub registry: Arc<ProcessRegistry>,
    pub cost_controller: Arc<CostController>,
    pub feature_processor: Arc<FeatureProcessor>,
    pub retrodiction_worker: Arc<RetrodictionWorker>,
    pub coordinator: Arc<Coordinator>,
    #[cfg(feature = "metrics")]
    pub metrics: Arc<observability::metrics::CoreMetrics>,
    trust_buffer_task: JoinHandle<()>,
}

impl PulseContext {
    /// Build the whole context from a config file path (optional) and
    /// runtime overrides. Tracing is initialized as a side effect, using
    /// the loaded configuration's `observability` section.
    pub async fn bootstrap(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let config = Arc::new(ConfigManager::load(config_path, overrides)?);
        let cfg = config.current();

        observability::init_tracing(&cfg.observability.log_filter, cfg.observability.json);

        let store = Arc::new(Store::open(cfg.store.to_store_config()).await?);

        let trust_tracker = Arc::new(TrustTracker::new(cfg.trust_prior));
        let trust_buffer = TrustUpdateBuffer::new(trust_tracker.clone(), cfg.trust_buffer.to_buffer_config());
        let trust_buffer_task = tokio::spawn(trust_buffer.clone().run());

        let metrics_store = Arc::new(MetricsStore::new());
        let metrics_collector = Arc::new(MetricsCollector::spawn(
            metrics_store.clone(),
            store.clone(),
            cfg.metrics_collector.to_collector_config(),
            Vec::new(),
        ));

        let registry = Arc::new(ProcessRegistry::new());
        let cost_controller = Arc::new(CostController::new(metrics_store.clone()));

        let feature_root = cfg.store.root.join("cache/features");
        let feature_backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(&feature_root));
        let feature_processor = Arc::new(FeatureProcessor::open(feature_backend, cfg.store.root.join("cache/features.ptr")).await?);

        let retrodiction_worker = Arc::new(RetrodictionWorker::new(feature_processor.clone(), trust_buffer.clone(), metrics_store.clone()));

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            registry.clone(),
            cost_controller.clone(),
            trust_buffer.clone(),
            trust_tracker.clone(),
            metrics_collector.clone(),
            retrodiction_worker.clone(),
            CoordinatorConfig {
                backpressure: cfg.coordinator.to_backpressure_config(),
                max_checkpoint_age: cfg.coordinator.max_checkpoint_age(),
            },
        ));

        #[cfg(feature = "metrics")]
        let metrics = Arc::new(observability::metrics::CoreMetrics::new());

        Ok(Self {
            config,
            store,
            trust_tracker,
            trust_buffer,
            metrics_store,
            metrics_collector,
            registry,
            cost_controller,
            feature_processor,
            retrodiction_worker,
            coordinator,
            #[cfg(feature = "metrics")]
            metrics,
            trust_buffer_task,
        })
    }

    /// Resume any runs whose last checkpoint is recent enough to trust
    /// (spec §4.11 orphan detection); call once after `bootstrap`, before
    /// dispatching new runs, with the set of `run_id`s a host expects to
    /// still be live.
    pub async fn reconstruct_runs(&self, run_ids: &[types::RunId]) -> Result<()> {
        let cfg = self.config.current();
        self.registry.reconstruct_from_checkpoints(&self.store, run_ids, cfg.coordinator.max_checkpoint_age()).await
    }

    /// Teardown in the reverse of construction order: stop accepting new
    /// coordinator work first (the caller is responsible for letting any
    /// in-flight `Coordinator::run` calls return), then drain the trust
    /// buffer and metrics collector, then close the store. Idempotent
    /// pieces (`Store::close`) tolerate repeated calls; this method itself
    /// is not (the trust buffer task is only joined once).
    pub async fn shutdown(self) -> Result<()> {
        self.trust_buffer.shutdown()?;
        let _ = self.trust_buffer_task.await;
        self.metrics_collector.shutdown().await;
        self.store.close().await?;
        Ok(())
    }
}
