//! Process Registry & Cost Controller (spec §4.11).
//!
//! One explicitly constructed, shared registry of in-flight runs rather
//! than a global. Rate limiting is a plain per-category token bucket,
//! with no distributed mode needed for an in-process registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{PulseError, Result};
use crate::metrics_store::MetricsStore;
use crate::store::Store;
use crate::types::{Budget, CostEvent, RunId};

/// Cooperative cancellation signal shared between the registry and whatever
/// worker loop is executing a run's batches.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled; otherwise waits for the
    /// next [`Self::cancel`] call.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    /// Found registered on startup with no checkpoint recent enough to
    /// trust; surfaced for an operator to resume or abandon explicitly.
    Orphaned,
}

#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub batches_completed: u64,
    pub items_processed: u64,
    pub errors: u64,
}

/// One run's registry entry. `status`/`stats` carry their own interior
/// mutability so a single `Arc<RunHandle>` can be held by the registry, the
/// coordinator, and a worker all at once.
pub struct RunHandle {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub cancel_token: CancelToken,
    status: Mutex<RunStatus>,
    stats: Mutex<RunStats>,
}

impl RunHandle {
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    pub fn stats(&self) -> RunStats {
        self.stats.lock().clone()
    }

    pub fn record_batch(&self, items: u64, errors: u64) {
        let mut stats = self.stats.lock();
        stats.batches_completed += 1;
        stats.items_processed += items;
        stats.errors += errors;
    }
}

/// Thread-safe `run_id -> RunHandle` map (spec §4.11 Process Registry).
pub struct ProcessRegistry {
    runs: DashMap<RunId, Arc<RunHandle>>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self { runs: DashMap::new() }
    }

    pub fn register(&self, run_id: RunId) -> Arc<RunHandle> {
        let handle = Arc::new(RunHandle {
            run_id: run_id.clone(),
            started_at: Utc::now(),
            cancel_token: CancelToken::new(),
            status: Mutex::new(RunStatus::Running),
            stats: Mutex::new(RunStats::default()),
        });
        self.runs.insert(run_id, handle.clone());
        handle
    }

    pub fn lookup(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.get(run_id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<Arc<RunHandle>> {
        self.runs.iter().map(|e| e.clone()).collect()
    }

    pub fn complete(&self, run_id: &str) -> Result<()> {
        let handle = self.lookup(run_id).ok_or_else(|| PulseError::RunNotFound(run_id.to_string()))?;
        *handle.status.lock() = RunStatus::Completed;
        Ok(())
    }

    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let handle = self.lookup(run_id).ok_or_else(|| PulseError::RunNotFound(run_id.to_string()))?;
        *handle.status.lock() = RunStatus::Cancelled;
        handle.cancel_token.cancel();
        Ok(())
    }

    /// Reconstruct registry entries for `run_ids` from the Store's
    /// checkpoints after a restart. A run whose latest checkpoint is older
    /// than `max_checkpoint_age` (or has none at all) is marked `Orphaned`
    /// rather than silently resumed (spec §4.11 "surfaced").
    pub async fn reconstruct_from_checkpoints(&self, store: &Store, run_ids: &[RunId], max_checkpoint_age: chrono::Duration) -> Result<()> {
        let now = Utc::now();
        for run_id in run_ids {
            let checkpoint = store.latest_checkpoint(run_id).await?;
            let status = match checkpoint {
                Some(cp) if now - cp.at <= max_checkpoint_age => RunStatus::Running,
                _ => RunStatus::Orphaned,
            };
            let handle = Arc::new(RunHandle {
                run_id: run_id.clone(),
                started_at: checkpoint.as_ref().map(|c| c.at).unwrap_or(now),
                cancel_token: CancelToken::new(),
                status: Mutex::new(status),
                stats: Mutex::new(RunStats::default()),
            });
            self.runs.insert(run_id.clone(), handle);
        }
        Ok(())
    }
}

/// Token-bucket rate limit, shared by the Cost Controller (per-category)
/// and the Ingestion Manager (per-adapter).
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub rate_per_second: f64,
    pub burst_capacity: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { rate_per_second: 10.0, burst_capacity: 10 }
    }
}

/// A single token bucket: `capacity` tokens, refilled continuously at
/// `refill_rate` tokens/second, consumed atomically by `try_consume`.
pub struct TokenBucket {
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            capacity: limit.burst_capacity,
            tokens: limit.burst_capacity as f64,
            last_refill: Instant::now(),
            refill_rate: limit.rate_per_second.max(0.0),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self, count: u64) -> bool {
        self.refill();
        if self.tokens >= count as f64 {
            self.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens as u64
    }
}

/// Fraction of a budget category's cap at which the soft threshold fires.
pub const DEFAULT_SOFT_THRESHOLD_RATIO: f64 = 0.8;

/// Tracks per-run cumulative cost across `{api_calls, compute_units,
/// storage_ops}` and enforces per-category rate limits at acquire time
/// (spec §4.11 Cost Controller).
pub struct CostController {
    metrics_store: Arc<MetricsStore>,
    soft_threshold_ratio: f64,
    blocked: DashMap<RunId, ()>,
    buckets: DashMap<(RunId, String), Mutex<TokenBucket>>,
    soft_warnings_emitted: AtomicU64,
}

impl CostController {
    pub fn new(metrics_store: Arc<MetricsStore>) -> Self {
        Self {
            metrics_store,
            soft_threshold_ratio: DEFAULT_SOFT_THRESHOLD_RATIO,
            blocked: DashMap::new(),
            buckets: DashMap::new(),
            soft_warnings_emitted: AtomicU64::new(0),
        }
    }

    pub fn with_soft_threshold_ratio(mut self, ratio: f64) -> Self {
        self.soft_threshold_ratio = ratio;
        self
    }

    fn cap_for(category: &str, budget: &Budget) -> f64 {
        match category {
            "api_calls" => budget.api_calls,
            "compute_units" => budget.compute_units,
            "storage_ops" => budget.storage_ops,
            _ => f64::INFINITY,
        }
    }

    /// Admit and record one cost event. Fails with `BudgetExceeded` (and
    /// marks the run blocked) once cumulative cost for the event's category
    /// reaches `budget`'s cap for that category; crosses a soft warning
    /// threshold before that without failing.
    pub async fn record_cost(&self, event: CostEvent, budget: &Budget) -> Result<()> {
        if self.blocked.contains_key(&event.run_id) {
            return Err(PulseError::BudgetExceeded { category: event.category.clone(), over_by: 0.0 });
        }
        self.metrics_store.put_cost_events(vec![event.clone()]).await?;
        let total = self.metrics_store.total_cost(&event.run_id);
        let cap = Self::cap_for(&event.category, budget);
        if total >= cap {
            self.blocked.insert(event.run_id.clone(), ());
            return Err(PulseError::BudgetExceeded { category: event.category.clone(), over_by: total - cap });
        }
        if cap.is_finite() && total >= cap * self.soft_threshold_ratio {
            self.soft_warnings_emitted.fetch_add(1, Ordering::Relaxed);
            warn!(run_id = %event.run_id, category = %event.category, total, cap, "soft cost threshold crossed");
        }
        Ok(())
    }

    /// Non-committing admission check consulted before dispatching a batch:
    /// would the run's already-accumulated cost plus `projected_units` push
    /// it past `budget`'s cap for `category`? Records nothing; marks the
    /// run blocked and returns `BudgetExceeded` if so (spec §4.9 "if the
    /// projected cost exceeds remaining budget").
    pub fn check_and_admit(&self, run_id: &str, category: &str, projected_units: f64, budget: &Budget) -> Result<()> {
        if self.blocked.contains_key(run_id) {
            return Err(PulseError::BudgetExceeded { category: category.to_string(), over_by: 0.0 });
        }
        let total = self.metrics_store.total_cost(run_id);
        let cap = Self::cap_for(category, budget);
        let projected = total + projected_units;
        if projected > cap {
            self.blocked.insert(run_id.to_string(), ());
            return Err(PulseError::BudgetExceeded { category: category.to_string(), over_by: projected - cap });
        }
        if cap.is_finite() && projected >= cap * self.soft_threshold_ratio {
            self.soft_warnings_emitted.fetch_add(1, Ordering::Relaxed);
            warn!(run_id, category, total, projected, cap, "soft cost threshold crossed (projected)");
        }
        Ok(())
    }

    pub fn is_blocked(&self, run_id: &str) -> bool {
        self.blocked.contains_key(run_id)
    }

    /// Operator action (or policy) lifting a hard-threshold block.
    pub fn unblock(&self, run_id: &str) {
        self.blocked.remove(run_id);
    }

    /// Acquire `count` units of rate-limited capacity for `(run_id,
    /// category)`, creating that category's bucket on first use.
    pub fn acquire(&self, run_id: &str, category: &str, count: u64, limit: RateLimit) -> bool {
        let key = (run_id.to_string(), category.to_string());
        let bucket = self.buckets.entry(key).or_insert_with(|| Mutex::new(TokenBucket::new(limit)));
        bucket.lock().try_consume(count)
    }

    pub fn soft_warnings_emitted(&self) -> u64 {
        self.soft_warnings_emitted.load(Ordering::Relaxed)
    }
}
