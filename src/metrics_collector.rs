//! Async Metrics Collector (spec §4.4).
//!
//! Single background worker draining a multi-producer queue into the
//! [`MetricsStore`] in batches, with per-batch retry and a dead-letter
//! fallback: `checked_shl` exponential backoff with 0-25% jitter, then
//! "exhaust retries, fall back to a durable sink" instead of dropping the
//! batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{PulseError, Result};
use crate::metrics_store::MetricsStore;
use crate::store::Store;
use crate::types::{ItemMetadata, MetricEvent};

/// Dataset name the dead-letter sink writes failed batches under (spec §4.4:
/// "a special dataset in the Store").
pub const DEAD_LETTER_DATASET: &str = "__dead_letter_metrics";

/// A callback offered a failed batch before it falls through to the
/// dead-letter sink. Returns `true` if it claimed (consumed) the batch.
pub type ErrorCallback = Arc<dyn Fn(&[MetricEvent]) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Flush once this many events are buffered.
    pub max_batch_size: usize,
    /// Flush the buffer once its oldest event has waited this long.
    pub max_linger: Duration,
    /// Bounded producer-to-worker queue depth.
    pub queue_capacity: usize,
    /// Retry attempts per batch before falling back to the dead-letter sink.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long `shutdown` waits for the queue to drain before the rest goes
    /// straight to the dead-letter sink.
    pub shutdown_drain_deadline: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 200,
            max_linger: Duration::from_millis(500),
            queue_capacity: 10_000,
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 10_000,
            shutdown_drain_deadline: Duration::from_secs(5),
        }
    }
}

async fn flush_with_retry(
    store: &MetricsStore,
    batch: Vec<MetricEvent>,
    config: &CollectorConfig,
) -> std::result::Result<(), Vec<MetricEvent>> {
    let max_attempts = config.max_retries.max(1);
    for attempt in 0..max_attempts {
        match store.put_many(batch.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt + 1 < max_attempts {
                    let exp = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                    let base = config.base_backoff_ms.saturating_mul(exp);
                    let delay = base.min(config.max_backoff_ms);
                    let jitter = (delay as f64 * 0.25 * rand::random::<f64>()) as u64;
                    tracing::warn!(attempt = attempt + 1, max_attempts, error = %e, "metrics batch flush failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
                } else {
                    tracing::error!(attempts = max_attempts, error = %e, "metrics batch flush failed after all retries");
                }
            }
        }
    }
    Err(batch)
}

async fn dead_letter(store: &Store, batch: &[MetricEvent]) {
    let payload = match bincode::serialize(batch) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize dead-lettered metric batch");
            return;
        }
    };
    if let Err(e) = store
        .put_item(DEAD_LETTER_DATASET, "metrics_collector", payload, ItemMetadata::default())
        .await
    {
        tracing::error!(error = %e, batch_len = batch.len(), "failed to write metric batch to dead-letter sink");
    }
}

async fn handle_failed_batch(
    batch: Vec<MetricEvent>,
    callbacks: &[ErrorCallback],
    dead_letter_store: &Store,
) {
    for callback in callbacks {
        if callback(&batch) {
            return;
        }
    }
    dead_letter(dead_letter_store, &batch).await;
}

/// Background worker + handle (spec §4.4 Async Metrics Collector).
pub struct MetricsCollector {
    sender: mpsc::Sender<MetricEvent>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn spawn(
        store: Arc<MetricsStore>,
        dead_letter_store: Arc<Store>,
        config: CollectorConfig,
        error_callbacks: Vec<ErrorCallback>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        let worker_shutdown = shutdown.clone();
        let handle = tokio::spawn(Self::run(rx, store, dead_letter_store, config, error_callbacks, worker_shutdown));
        Self {
            sender: tx,
            shutdown,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue one metric event. Backpressures on a full queue by blocking
    /// the caller until space frees up.
    pub async fn submit(&self, event: MetricEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| PulseError::Unknown("metrics collector worker is no longer running".into()))
    }

    /// Fraction of the producer queue currently occupied, in `[0, 1]`.
    /// Consulted by the Coordinator for backpressure (spec §4.9).
    pub fn queue_pressure(&self) -> f64 {
        let max = self.sender.max_capacity() as f64;
        if max == 0.0 {
            return 0.0;
        }
        1.0 - (self.sender.capacity() as f64 / max)
    }

    /// Signal shutdown and wait for the worker to drain and exit.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(
        mut rx: mpsc::Receiver<MetricEvent>,
        store: Arc<MetricsStore>,
        dead_letter_store: Arc<Store>,
        config: CollectorConfig,
        callbacks: Vec<ErrorCallback>,
        shutdown: Arc<Notify>,
    ) {
        let mut buffer: Vec<MetricEvent> = Vec::with_capacity(config.max_batch_size);
        let linger = tokio::time::sleep(config.max_linger);
        tokio::pin!(linger);
        let mut lingering = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    rx.close();
                    let deadline = tokio::time::Instant::now() + config.shutdown_drain_deadline;
                    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                        buffer.push(event);
                        if buffer.len() >= config.max_batch_size {
                            let batch = std::mem::take(&mut buffer);
                            if let Err(failed) = flush_with_retry(&store, batch, &config).await {
                                handle_failed_batch(failed, &callbacks, &dead_letter_store).await;
                            }
                        }
                    }
                    if !buffer.is_empty() {
                        // Whatever's left after the drain deadline goes straight
                        // to the dead-letter sink rather than risking another
                        // retry loop delaying shutdown further.
                        dead_letter(&dead_letter_store, &buffer).await;
                    }
                    return;
                }

                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if buffer.is_empty() {
                                linger.as_mut().reset(tokio::time::Instant::now() + config.max_linger);
                                lingering = true;
                            }
                            buffer.push(event);
                            if buffer.len() >= config.max_batch_size {
                                lingering = false;
                                let batch = std::mem::take(&mut buffer);
                                if let Err(failed) = flush_with_retry(&store, batch, &config).await {
                                    handle_failed_batch(failed, &callbacks, &dead_letter_store).await;
                                }
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                let batch = std::mem::take(&mut buffer);
                                if let Err(failed) = flush_with_retry(&store, batch, &config).await {
                                    handle_failed_batch(failed, &callbacks, &dead_letter_store).await;
                                }
                            }
                            return;
                        }
                    }
                }

                () = &mut linger, if lingering => {
                    lingering = false;
                    if !buffer.is_empty() {
                        let batch = std::mem::take(&mut buffer);
                        if let Err(failed) = flush_with_retry(&store, batch, &config).await {
                            handle_failed_batch(failed, &callbacks, &dead_letter_store).await;
                        }
                    }
                }
            }
        }
    }
}
