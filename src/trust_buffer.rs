//! Trust Update Buffer (spec §4.3): coalesce high-rate per-entity updates
//! before they reach the [`crate::trust::TrustTracker`].
//!
//! Bounded, lock-protected state shared behind an `Arc`, with a background
//! task doing the actual flush work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PulseError, Result};
use crate::trust::TrustTracker;
use crate::types::TrustUpdate;

/// Buffer configuration.
#[derive(Debug, Clone)]
pub struct TrustBufferConfig {
    /// Per-entity queue depth that triggers an eager flush.
    pub flush_threshold: usize,
    /// Oldest-pending-update age that triggers a flush.
    pub max_linger: Duration,
    /// How long `push` blocks when the queue is full before returning
    /// `BufferFull`.
    pub enqueue_timeout: Duration,
    /// Hard cap on total pending updates across all entities.
    pub max_pending: usize,
}

impl Default for TrustBufferConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 100,
            max_linger: Duration::from_millis(50),
            enqueue_timeout: Duration::from_millis(100),
            max_pending: 100_000,
        }
    }
}

struct PendingEntry {
    update: TrustUpdate,
    enqueued_at: Instant,
}

struct State {
    // FIFO per entity_id preserves enqueue order through flush.
    queues: std::collections::HashMap<String, VecDeque<PendingEntry>>,
    total_pending: usize,
}

/// Bounded, timed coalescing buffer in front of a [`TrustTracker`].
pub struct TrustUpdateBuffer {
    config: TrustBufferConfig,
    tracker: Arc<TrustTracker>,
    state: Mutex<State>,
    notify: Notify,
    shutdown: Mutex<bool>,
}

impl TrustUpdateBuffer {
    pub fn new(tracker: Arc<TrustTracker>, config: TrustBufferConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tracker,
            state: Mutex::new(State {
                queues: std::collections::HashMap::new(),
                total_pending: 0,
            }),
            notify: Notify::new(),
            shutdown: Mutex::new(false),
        })
    }

    /// Enqueue one update. Blocks up to `enqueue_timeout` if the buffer is
    /// at `max_pending`; returns [`PulseError::BufferFull`] on timeout so
    /// the caller decides to drop or retry (spec §4.3 Backpressure).
    pub async fn push(&self, update: TrustUpdate) -> Result<()> {
        let deadline = Instant::now() + self.config.enqueue_timeout;
        loop {
            {
                let mut state = self.state.lock();
                if state.total_pending < self.config.max_pending {
                    let queue = state.queues.entry(update.entity_id.clone()).or_default();
                    queue.push_back(PendingEntry {
                        update,
                        enqueued_at: Instant::now(),
                    });
                    state.total_pending += 1;
                    let should_flush_eager = queue.len() >= self.config.flush_threshold;
                    drop(state);
                    if should_flush_eager {
                        self.flush_ready(false)?;
                    }
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(PulseError::BufferFull);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Flush every entity whose queue is over threshold or whose oldest
    /// entry has aged past `max_linger`. If `force` is set, flush
    /// everything regardless.
    fn flush_ready(&self, force: bool) -> Result<()> {
        let mut batch: Vec<TrustUpdate> = Vec::new();
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let threshold = self.config.flush_threshold;
            let max_linger = self.config.max_linger;
            let entity_ids: Vec<String> = state.queues.keys().cloned().collect();
            for entity_id in entity_ids {
                let ready = {
                    let queue = state.queues.get(&entity_id).expect("key from keys()");
                    force
                        || queue.len() >= threshold
                        || queue
                            .front()
                            .is_some_and(|e| now.duration_since(e.enqueued_at) >= max_linger)
                };
                if ready {
                    if let Some(queue) = state.queues.remove(&entity_id) {
                        state.total_pending -= queue.len();
                        batch.extend(queue.into_iter().map(|e| e.update));
                    }
                }
            }
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), "flushing trust update batch");
            self.tracker.batch_update(&batch)?;
        }
        Ok(())
    }

    /// Explicit flush: force every pending update through immediately.
    pub fn flush(&self) -> Result<()> {
        self.flush_ready(true)
    }

    /// Fraction of `max_pending` currently occupied, in `[0, 1]`.
    /// Consulted by the Coordinator for backpressure (spec §4.9).
    pub fn pending_pressure(&self) -> f64 {
        let state = self.state.lock();
        if self.config.max_pending == 0 {
            return 0.0;
        }
        state.total_pending as f64 / self.config.max_pending as f64
    }

    /// Background loop that periodically checks linger deadlines. Run this
    /// in a spawned task; it returns once [`Self::shutdown`] is called.
    pub async fn run(self: Arc<Self>) {
        let tick = self.config.max_linger.max(Duration::from_millis(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.flush_ready(false) {
                        warn!(error = %e, "periodic trust buffer flush failed");
                    }
                }
                _ = self.notify.notified() => {
                    if *self.shutdown.lock() {
                        let _ = self.flush_ready(true);
                        return;
                    }
                }
            }
        }
    }

    /// Drain all pending updates and stop the background loop.
    pub fn shutdown(&self) -> Result<()> {
        *self.shutdown.lock() = true;
        let result = self.flush_ready(true);
        self.notify.notify_waiters();
        result
    }
}
