//! Tracing initialization and Prometheus metric handles (spec §A.2 ambient
//! stack).
//!
//! `init_tracing` sets up `tracing-subscriber` with an env-filter. The
//! metric handles use a `static LazyLock<DashMap<...>>` registration cache
//! so registering the same name twice logs and reuses the existing handle
//! rather than panicking — this crate may be embedded by a host process
//! that also links other Prometheus users.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global `tracing` subscriber from `log_filter` (an
/// `EnvFilter` directive, e.g. `"pulse_core=info,warn"`). Honors
/// `RUST_LOG` if set, falling back to `log_filter` otherwise. Idempotent:
/// a second call is a no-op rather than a panic, since host binaries may
/// call this defensively.
pub fn init_tracing(log_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter.to_string()));
    let subscriber = fmt().with_env_filter(filter);
    let result = if json { subscriber.json().try_init() } else { subscriber.try_init() };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized; skipping");
    }
}

/// Prometheus metric handles, behind an opt-in `metrics` feature.
#[cfg(feature = "metrics")]
pub mod metrics {
    use std::sync::LazyLock;

    use dashmap::mapref::entry::Entry;
    use dashmap::DashMap;
    use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts};
    use tracing::{debug, warn};

    static COUNTERS: LazyLock<DashMap<&'static str, Counter>> = LazyLock::new(DashMap::new);
    static COUNTER_VECS: LazyLock<DashMap<&'static str, CounterVec>> = LazyLock::new(DashMap::new);
    static GAUGES: LazyLock<DashMap<&'static str, Gauge>> = LazyLock::new(DashMap::new);
    static HISTOGRAM_VECS: LazyLock<DashMap<&'static str, HistogramVec>> = LazyLock::new(DashMap::new);

    /// Register (or reuse) a counter. Registration failures (e.g. the host
    /// process already registered the same name against the default
    /// registry) are logged and the existing metric handle is reused rather
    /// than panicking.
    pub fn counter(name: &'static str, help: &str) -> Counter {
        if let Some(existing) = COUNTERS.get(name) {
            return existing.clone();
        }
        match COUNTERS.entry(name) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let metric = Counter::new(name, help).expect("metric name is a valid Prometheus identifier");
                register(&metric, name);
                entry.insert(metric.clone());
                metric
            }
        }
    }

    pub fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> CounterVec {
        if let Some(existing) = COUNTER_VECS.get(name) {
            return existing.clone();
        }
        match COUNTER_VECS.entry(name) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let metric =
                    CounterVec::new(Opts::new(name, help), labels).expect("metric name/labels are valid Prometheus identifiers");
                register(&metric, name);
                entry.insert(metric.clone());
                metric
            }
        }
    }

    pub fn gauge(name: &'static str, help: &str) -> Gauge {
        if let Some(existing) = GAUGES.get(name) {
            return existing.clone();
        }
        match GAUGES.entry(name) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let metric = Gauge::new(name, help).expect("metric name is a valid Prometheus identifier");
                register(&metric, name);
                entry.insert(metric.clone());
                metric
            }
        }
    }

    pub fn histogram_vec(name: &'static str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> HistogramVec {
        if let Some(existing) = HISTOGRAM_VECS.get(name) {
            return existing.clone();
        }
        match HISTOGRAM_VECS.entry(name) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let metric = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
                    .expect("metric name/labels are valid Prometheus identifiers");
                register(&metric, name);
                entry.insert(metric.clone());
                metric
            }
        }
    }

    fn register(collector: &(impl prometheus::core::Collector + Clone + 'static), name: &str) {
        if let Err(e) = prometheus::default_registry().register(Box::new(collector.clone())) {
            match e {
                prometheus::Error::AlreadyReg => debug!(metric = name, "metric already registered; reusing"),
                other => warn!(metric = name, error = %other, "metric registration failed; continuing unregistered"),
            }
        }
    }

    /// Names for every metric the core emits. Centralized exactly as the
    /// teacher's `metrics_constants` module does, so components import a
    /// constant rather than repeating a string literal.
    pub mod names {
        pub const INGESTION_ITEMS_FETCHED_TOTAL: &str = "pulse_ingestion_items_fetched_total";
        pub const INGESTION_VALIDATION_ERRORS_TOTAL: &str = "pulse_ingestion_validation_errors_total";
        pub const COORDINATOR_BATCHES_COMPLETED_TOTAL: &str = "pulse_coordinator_batches_completed_total";
        pub const COORDINATOR_BATCHES_FAILED_TOTAL: &str = "pulse_coordinator_batches_failed_total";
        pub const COORDINATOR_BACKPRESSURE: &str = "pulse_coordinator_backpressure";
        pub const COST_BUDGET_EXCEEDED_TOTAL: &str = "pulse_cost_budget_exceeded_total";
        pub const DRIFT_REGIME_EVENTS_TOTAL: &str = "pulse_drift_regime_events_total";
        pub const TRUST_BUFFER_FLUSH_LATENCY_MS: &str = "pulse_trust_buffer_flush_latency_ms";
    }

    /// Convenience handle bundle constructed once at process startup and
    /// threaded through components that need to record metrics (spec §9
    /// "process-wide state is initialized in one place").
    #[derive(Clone)]
    pub struct CoreMetrics {
        pub ingestion_items_fetched: CounterVec,
        pub ingestion_validation_errors: CounterVec,
        pub coordinator_batches_completed: Counter,
        pub coordinator_batches_failed: Counter,
        pub coordinator_backpressure: Gauge,
        pub cost_budget_exceeded: CounterVec,
        pub drift_regime_events: CounterVec,
        pub trust_buffer_flush_latency_ms: HistogramVec,
    }

    impl CoreMetrics {
        pub fn new() -> Self {
            Self {
                ingestion_items_fetched: counter_vec(names::INGESTION_ITEMS_FETCHED_TOTAL, "Items fetched by an ingestion adapter", &["adapter_id"]),
                ingestion_validation_errors: counter_vec(
                    names::INGESTION_VALIDATION_ERRORS_TOTAL,
                    "Items dropped for failing schema validation",
                    &["adapter_id"],
                ),
                coordinator_batches_completed: counter(names::COORDINATOR_BATCHES_COMPLETED_TOTAL, "Retrodiction batches completed"),
                coordinator_batches_failed: counter(names::COORDINATOR_BATCHES_FAILED_TOTAL, "Retrodiction batches failed"),
                coordinator_backpressure: gauge(names::COORDINATOR_BACKPRESSURE, "Current coordinator backpressure reading in [0, 1]"),
                cost_budget_exceeded: counter_vec(names::COST_BUDGET_EXCEEDED_TOTAL, "Budget-exceeded events by category", &["category"]),
                drift_regime_events: counter_vec(names::DRIFT_REGIME_EVENTS_TOTAL, "Regime events emitted by kind", &["kind"]),
                trust_buffer_flush_latency_ms: histogram_vec(
                    names::TRUST_BUFFER_FLUSH_LATENCY_MS,
                    "Trust update buffer flush latency in milliseconds",
                    vec![0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0],
                    &[],
                ),
            }
        }
    }

    impl Default for CoreMetrics {
        fn default() -> Self {
            Self::new()
        }
    }

}
