//! Bayesian (Beta) trust tracker (spec §4.2).
//!
//! Maintains a `(alpha, beta)` reliability estimate per named entity: a
//! single map of per-entity state behind simple, documented accessor
//! methods, with a fixed construction-time prior. Beta-distribution
//! semantics (mean, credible interval, additive updates, decay) follow
//! spec §4.2/§8.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, Result};
use crate::types::{TrustEntity, TrustUpdate};

/// Construction-time prior shared by all entities created lazily on first
/// update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrustPrior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for TrustPrior {
    fn default() -> Self {
        Self { alpha: 1.0, beta: 1.0 }
    }
}

/// Snapshot-summary line for one entity, as returned by [`TrustTracker::report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustReportEntry {
    pub entity_id: String,
    pub mean: f64,
    pub samples: u64,
    pub ci_width: f64,
    pub last_update_at: chrono::DateTime<Utc>,
}

/// A serializable, atomic snapshot of all tracked entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrustSnapshot {
    prior: TrustPrior,
    entities: HashMap<String, TrustEntity>,
}

/// Thread-safe Beta-Bayesian reliability estimator.
///
/// All operations are safe under parallel callers. `batch_update` acquires
/// the lock once per distinct entity touched, so the hot path scales with
/// distinct entities per batch rather than total events (spec §4.2
/// Performance).
pub struct TrustTracker {
    prior: TrustPrior,
    entities: Arc<DashMap<String, RwLock<TrustEntity>>>,
}

impl TrustTracker {
    pub fn new(prior: TrustPrior) -> Self {
        Self {
            prior,
            entities: Arc::new(DashMap::new()),
        }
    }

    fn validate(successes: f64, failures: f64, weight: f64) -> Result<()> {
        if successes < 0.0 || failures < 0.0 {
            return Err(PulseError::InvalidUpdate("successes/failures must be non-negative".into()));
        }
        if successes + failures <= 0.0 {
            return Err(PulseError::InvalidUpdate("successes + failures must be > 0".into()));
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(PulseError::InvalidUpdate("weight must be finite and > 0".into()));
        }
        Ok(())
    }

    fn entry_or_prior(&self, entity_id: &str) -> dashmap::mapref::one::Ref<'_, String, RwLock<TrustEntity>> {
        if !self.entities.contains_key(entity_id) {
            self.entities.entry(entity_id.to_string()).or_insert_with(|| {
                RwLock::new(TrustEntity {
                    entity_id: entity_id.to_string(),
                    alpha: self.prior.alpha,
                    beta: self.prior.beta,
                    prior_alpha: self.prior.alpha,
                    prior_beta: self.prior.beta,
                    sample_count: 0,
                    last_update_at: Utc::now(),
                })
            });
        }
        self.entities.get(entity_id).expect("just inserted")
    }

    /// Apply one weighted observation. Unknown entities are created lazily
    /// with the prior; `InvalidUpdate` is returned for negative counts or
    /// non-finite weight. `UnknownEntity` is never raised (spec §4.2).
    pub fn update(&self, entity_id: &str, successes: f64, failures: f64, weight: f64) -> Result<()> {
        Self::validate(successes, failures, weight)?;
        let entry = self.entry_or_prior(entity_id);
        let mut e = entry.write();
        e.alpha += successes * weight;
        e.beta += failures * weight;
        e.sample_count += 1;
        e.last_update_at = Utc::now();
        Ok(())
    }

    /// Apply a batch of updates, aggregated by `entity_id` so that each
    /// entity's lock is acquired once regardless of how many updates in the
    /// batch target it. Additive updates commute, so this is equivalent in
    /// effect to applying each update sequentially via [`Self::update`]
    /// (spec §8 commutativity law).
    pub fn batch_update(&self, updates: &[TrustUpdate]) -> Result<()> {
        let mut grouped: HashMap<&str, (f64, f64, u64)> = HashMap::new();
        for u in updates {
            Self::validate(u.successes, u.failures, u.weight)?;
            let slot = grouped.entry(u.entity_id.as_str()).or_insert((0.0, 0.0, 0));
            slot.0 += u.successes * u.weight;
            slot.1 += u.failures * u.weight;
            slot.2 += 1;
        }
        let now = Utc::now();
        for (entity_id, (dalpha, dbeta, count)) in grouped {
            let entry = self.entry_or_prior(entity_id);
            let mut e = entry.write();
            e.alpha += dalpha;
            e.beta += dbeta;
            e.sample_count += count;
            e.last_update_at = now;
        }
        Ok(())
    }

    /// Read the current state for an entity, if it has ever been updated.
    pub fn get(&self, entity_id: &str) -> Option<TrustEntity> {
        self.entities.get(entity_id).map(|e| e.read().clone())
    }

    /// Posterior mean `alpha / (alpha + beta)`. Entities never updated take
    /// the prior's mean.
    pub fn mean(&self, entity_id: &str) -> f64 {
        match self.get(entity_id) {
            Some(e) => e.mean(),
            None => self.prior.alpha / (self.prior.alpha + self.prior.beta),
        }
    }

    /// Equal-tailed credible interval at confidence `p` (default caller
    /// passes `0.95`), via the Beta distribution's quantile function.
    pub fn confidence_interval(&self, entity_id: &str, p: f64) -> (f64, f64) {
        let (alpha, beta) = match self.get(entity_id) {
            Some(e) => (e.alpha, e.beta),
            None => (self.prior.alpha, self.prior.beta),
        };
        let tail = (1.0 - p) / 2.0;
        let lo = beta_quantile(alpha, beta, tail);
        let hi = beta_quantile(alpha, beta, 1.0 - tail);
        (lo, hi)
    }

    /// Multiply `(alpha - prior_alpha, beta - prior_beta)` by `factor`,
    /// preserving the prior. `factor = 1` is a no-op; `factor = 0` resets to
    /// the prior (spec §8 boundary behavior). At zero samples the delta is
    /// already zero, so decay is the identity operation regardless of
    /// `factor` (see `DESIGN.md` open-question log).
    pub fn decay(&self, entity_id: Option<&str>, factor: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(PulseError::InvalidUpdate("decay factor must be in (0, 1]".into()));
        }
        let decay_one = |mut e: parking_lot::RwLockWriteGuard<'_, TrustEntity>| {
            e.alpha = e.prior_alpha + (e.alpha - e.prior_alpha) * factor;
            e.beta = e.prior_beta + (e.beta - e.prior_beta) * factor;
        };
        match entity_id {
            Some(id) => {
                if let Some(entry) = self.entities.get(id) {
                    decay_one(entry.write());
                }
            }
            None => {
                for entry in self.entities.iter() {
                    decay_one(entry.write());
                }
            }
        }
        Ok(())
    }

    /// Serialize the full tracker state. Concurrent with other operations,
    /// `snapshot` observes either the full effect of any in-flight
    /// `batch_update` or none of it — each entity's lock is read
    /// independently but `batch_update` holds its per-entity lock for the
    /// whole grouped delta, so no torn write is ever visible.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let entities = self
            .entities
            .iter()
            .map(|e| (e.key().clone(), e.value().read().clone()))
            .collect();
        let snap = TrustSnapshot {
            prior: self.prior,
            entities,
        };
        bincode::serialize(&snap).map_err(|e| PulseError::SerializationError(e.to_string()))
    }

    /// Atomically restore state from a prior [`Self::snapshot`].
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let snap: TrustSnapshot =
            bincode::deserialize(bytes).map_err(|e| PulseError::SerializationError(e.to_string()))?;
        self.entities.clear();
        for (id, entity) in snap.entities {
            self.entities.insert(id, RwLock::new(entity));
        }
        Ok(())
    }

    /// Per-entity summary: mean, sample count, credible-interval width,
    /// last update time.
    pub fn report(&self) -> Vec<TrustReportEntry> {
        self.entities
            .iter()
            .map(|e| {
                let entity = e.value().read();
                let (lo, hi) = self.confidence_interval(&entity.entity_id, 0.95);
                TrustReportEntry {
                    entity_id: entity.entity_id.clone(),
                    mean: entity.mean(),
                    samples: entity.sample_count,
                    ci_width: hi - lo,
                    last_update_at: entity.last_update_at,
                }
            })
            .collect()
    }
}

/// Approximate the Beta(alpha, beta) quantile function via bisection on the
/// regularized incomplete beta function. Adequate precision (1e-9) for
/// confidence-interval reporting without pulling in a stats crate the
/// teacher doesn't already depend on.
fn beta_quantile(alpha: f64, beta: f64, p: f64) -> f64 {
    if p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }
    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    for _ in 0..100 {
        let mid = (lo + hi) / 2.0;
        if regularized_incomplete_beta(mid, alpha, beta) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

/// Regularized incomplete beta function `I_x(a, b)`, via the continued
/// fraction method (Numerical Recipes form).
fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_beta = ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b);
    let front = (a * x.ln() + b * (1.0 - x).ln() - ln_beta).exp() / a;
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b)
    } else {
        1.0 - (regularized_incomplete_beta(1.0 - x, b, a))
    }
}

fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: u32 = 200;
    const EPS: f64 = 1e-12;
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < 1e-30 {
        d = 1e-30;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..MAX_ITER {
        let m_f = m as f64;
        let m2 = 2.0 * m_f;

        let aa = m_f * (b - m_f) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < 1e-30 {
            d = 1e-30;
        }
        c = 1.0 + aa / c;
        if c.abs() < 1e-30 {
            c = 1e-30;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m_f) * (qab + m_f) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < 1e-30 {
            d = 1e-30;
        }
        c = 1.0 + aa / c;
        if c.abs() < 1e-30 {
            c = 1e-30;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Stirling-series log-gamma, accurate enough for the confidence-interval
/// bisection above.
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5 - (x + 0.5) * (x + 5.5).ln();
    let mut ser = 1.000000000190015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_uses_prior_mean() {
        let t = TrustTracker::new(TrustPrior::default());
        assert!((t.mean("never-seen") - 0.5).abs() < 1e-12);
    }

    #[test]
    fn update_never_drops_below_prior() {
        let t = TrustTracker::new(TrustPrior { alpha: 2.0, beta: 3.0 });
        t.update("r_a", 1.0, 0.0, 1.0).unwrap();
        let e = t.get("r_a").unwrap();
        assert!(e.alpha >= e.prior_alpha);
        assert!(e.beta >= e.prior_beta);
    }

    #[test]
    fn negative_counts_are_rejected() {
        let t = TrustTracker::new(TrustPrior::default());
        assert!(t.update("x", -1.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn zero_total_observation_is_rejected() {
        let t = TrustTracker::new(TrustPrior::default());
        assert!(t.update("x", 0.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn batch_update_matches_sequential_updates() {
        let prior = TrustPrior { alpha: 1.0, beta: 1.0 };
        let sequential = TrustTracker::new(prior);
        let batched = TrustTracker::new(prior);

        let updates = vec![
            TrustUpdate::new("r_a", 1.0, 0.0),
            TrustUpdate::new("r_a", 0.0, 1.0),
            TrustUpdate::new("r_a", 1.0, 0.0).with_weight(2.0),
            TrustUpdate::new("r_b", 0.0, 1.0),
        ];

        for u in &updates {
            sequential.update(&u.entity_id, u.successes, u.failures, u.weight).unwrap();
        }
        batched.batch_update(&updates).unwrap();

        let a_seq = sequential.get("r_a").unwrap();
        let a_batch = batched.get("r_a").unwrap();
        assert!((a_seq.alpha - a_batch.alpha).abs() < 1e-9);
        assert!((a_seq.beta - a_batch.beta).abs() < 1e-9);

        let b_seq = sequential.get("r_b").unwrap();
        let b_batch = batched.get("r_b").unwrap();
        assert!((b_seq.alpha - b_batch.alpha).abs() < 1e-9);
        assert!((b_seq.beta - b_batch.beta).abs() < 1e-9);
    }

    #[test]
    fn decay_factor_one_is_noop() {
        let t = TrustTracker::new(TrustPrior::default());
        t.update("r_a", 3.0, 1.0, 1.0).unwrap();
        let before = t.get("r_a").unwrap();
        t.decay(Some("r_a"), 1.0).unwrap();
        let after = t.get("r_a").unwrap();
        assert!((before.alpha - after.alpha).abs() < 1e-12);
        assert!((before.beta - after.beta).abs() < 1e-12);
    }

    #[test]
    fn decay_factor_zero_resets_to_prior() {
        let t = TrustTracker::new(TrustPrior { alpha: 2.0, beta: 2.0 });
        t.update("r_a", 5.0, 5.0, 1.0).unwrap();
        t.decay(Some("r_a"), 0.0).unwrap();
        let after = t.get("r_a").unwrap();
        assert!((after.alpha - after.prior_alpha).abs() < 1e-12);
        assert!((after.beta - after.prior_beta).abs() < 1e-12);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let t = TrustTracker::new(TrustPrior::default());
        t.update("r_a", 4.0, 3.0, 1.0).unwrap();
        let bytes = t.snapshot().unwrap();

        let restored = TrustTracker::new(TrustPrior::default());
        restored.restore(&bytes).unwrap();
        assert_eq!(t.get("r_a").unwrap().alpha, restored.get("r_a").unwrap().alpha);
    }

    #[test]
    fn confidence_interval_contains_mean() {
        let t = TrustTracker::new(TrustPrior::default());
        t.update("r_a", 20.0, 5.0, 1.0).unwrap();
        let mean = t.mean("r_a");
        let (lo, hi) = t.confidence_interval("r_a", 0.95);
        assert!(lo < mean && mean < hi, "expected {lo} < {mean} < {hi}");
    }
}
