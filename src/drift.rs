//! Drift / Regime Detector (spec §4.7).
//!
//! Per-feature two-sample tests (Kolmogorov–Smirnov for continuous values,
//! chi-squared for categorical counts) against a reference window, rolled
//! up into an importance-weighted aggregate score with hysteresis and a
//! per-`(dataset, kind)` cooldown. No statistical-test crate exists in the
//! surrounding stack, so the tests and their p-value approximations are
//! authored fresh; the cooldown/debounce bookkeeping follows the same
//! rate-limited-emission shape `metrics_collector.rs`'s dead-letter sink
//! uses for its own log throttling.
//!
//! Also provides two lightweight online detectors (ADWIN- and KSWIN-style)
//! for scalar streams, as simplified approximations of the published
//! algorithms rather than full reimplementations — there is no training
//! loop here to justify carrying a dedicated streaming-stats dependency for
//! them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::types::RegimeEvent;

/// A window's worth of values for one feature.
#[derive(Debug, Clone)]
pub enum FeatureSample {
    Continuous(Vec<f64>),
    Categorical(HashMap<String, u64>),
}

impl FeatureSample {
    fn sample_size(&self) -> usize {
        match self {
            FeatureSample::Continuous(v) => v.len(),
            FeatureSample::Categorical(m) => m.values().sum::<u64>() as usize,
        }
    }
}

/// Two-sample Kolmogorov–Smirnov test. Returns `None` if either sample is
/// empty. The p-value uses the standard asymptotic Kolmogorov distribution
/// approximation (Marsaglia/Kolmogorov), not an exact finite-sample value.
pub fn ks_test(reference: &[f64], current: &[f64]) -> Option<f64> {
    if reference.is_empty() || current.is_empty() {
        return None;
    }
    let mut a = reference.to_vec();
    let mut b = current.to_vec();
    a.sort_by(|x, y| x.partial_cmp(y).unwrap());
    b.sort_by(|x, y| x.partial_cmp(y).unwrap());

    let mut merged: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    merged.sort_by(|x, y| x.partial_cmp(y).unwrap());
    merged.dedup_by(|x, y| (*x - *y).abs() < f64::EPSILON);

    let n = a.len() as f64;
    let m = b.len() as f64;
    let mut d_max: f64 = 0.0;
    for &x in &merged {
        let cdf_a = a.partition_point(|&v| v <= x) as f64 / n;
        let cdf_b = b.partition_point(|&v| v <= x) as f64 / m;
        d_max = d_max.max((cdf_a - cdf_b).abs());
    }

    let en = (n * m / (n + m)).sqrt();
    Some(ks_p_value((en + 0.12 + 0.11 / en) * d_max))
}

/// `Q_KS` tail probability via the alternating series; used to turn a KS
/// statistic into a p-value.
fn ks_p_value(t: f64) -> f64 {
    if t < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    for k in 1..=100 {
        let term = (-1.0_f64).powi(k - 1) * (-2.0 * (k as f64).powi(2) * t * t).exp();
        sum += term;
        if term.abs() < 1e-10 {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// Chi-squared test of homogeneity between two categorical count
/// distributions. `reference` category proportions are rescaled to
/// `current`'s total before computing the statistic. Returns `None` if
/// either distribution has fewer than 2 categories or zero total count.
pub fn chi_squared_test(reference: &HashMap<String, u64>, current: &HashMap<String, u64>) -> Option<f64> {
    let ref_total: u64 = reference.values().sum();
    let cur_total: u64 = current.values().sum();
    if ref_total == 0 || cur_total == 0 {
        return None;
    }
    let mut categories: Vec<&String> = reference.keys().chain(current.keys()).collect();
    categories.sort();
    categories.dedup();
    if categories.len() < 2 {
        return None;
    }

    let scale = cur_total as f64 / ref_total as f64;
    let mut statistic = 0.0;
    let mut df = 0usize;
    for category in &categories {
        let expected = *reference.get(*category).unwrap_or(&0) as f64 * scale;
        let observed = *current.get(*category).unwrap_or(&0) as f64;
        if expected > 0.0 {
            statistic += (observed - expected).powi(2) / expected;
            df += 1;
        }
    }
    if df < 2 {
        return None;
    }
    Some(chi_squared_sf(statistic, (df - 1) as f64))
}

/// Upper-tail probability of the chi-squared distribution with `k` degrees
/// of freedom, `P(X > x)`, via the regularized incomplete gamma function.
fn chi_squared_sf(x: f64, k: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    (1.0 - regularized_lower_incomplete_gamma(k / 2.0, x / 2.0)).clamp(0.0, 1.0)
}

fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        return (std::f64::consts::PI / (std::f64::consts::PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = COEFFICIENTS[0];
    let t = x + 7.5;
    for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

fn regularized_lower_incomplete_gamma(a: f64, x: f64) -> f64 {
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_continued_fraction(a, x)
    }
}

fn gamma_series(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let mut term = 1.0 / a;
    let mut sum = term;
    let mut n = a;
    for _ in 0..200 {
        n += 1.0;
        term *= x / n;
        sum += term;
        if term.abs() < sum.abs() * 1e-12 {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    let tiny = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..200 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < 1e-12 {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Tuning for [`DriftDetector`] (spec §4.7).
#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub p_threshold: f64,
    pub min_sample_size: usize,
    pub event_threshold: f64,
    pub hysteresis_margin: f64,
    pub cooldown: chrono::Duration,
    pub importance: HashMap<String, f64>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            p_threshold: 0.01,
            min_sample_size: 30,
            event_threshold: 0.3,
            hysteresis_margin: 0.1,
            cooldown: chrono::Duration::seconds(300),
            importance: HashMap::new(),
        }
    }
}

impl DriftConfig {
    fn weight_of(&self, feature: &str) -> f64 {
        *self.importance.get(feature).unwrap_or(&1.0)
    }
}

#[derive(Default)]
struct DebounceState {
    armed: bool,
    last_emitted_at: Option<DateTime<Utc>>,
}

/// Compares reference and current feature-batch distributions and emits
/// debounced [`RegimeEvent`]s (spec §4.7). Never mutates stored data; it
/// only reads feature batches handed to it by the caller.
pub struct DriftDetector {
    config: DriftConfig,
    state: DashMap<(String, String), DebounceState>,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config, state: DashMap::new() }
    }

    /// Evaluate one `(dataset, kind)` comparison. Returns `Ok(None)` when no
    /// event should fire: no feature had enough samples to test, the
    /// aggregate score didn't cross `event_threshold`, or it did but the
    /// pair is still in its cooldown window.
    pub fn detect(
        &self,
        dataset_id: &str,
        kind: &str,
        reference: &HashMap<String, FeatureSample>,
        current: &HashMap<String, FeatureSample>,
        reference_window: (DateTime<Utc>, DateTime<Utc>),
        current_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Option<RegimeEvent>> {
        let mut signals = HashMap::new();
        let mut weighted_flagged = 0.0;
        let mut weighted_total = 0.0;

        for (feature, ref_sample) in reference {
            let Some(cur_sample) = current.get(feature) else { continue };
            if ref_sample.sample_size() < self.config.min_sample_size || cur_sample.sample_size() < self.config.min_sample_size {
                continue;
            }
            let p_value = match (ref_sample, cur_sample) {
                (FeatureSample::Continuous(r), FeatureSample::Continuous(c)) => ks_test(r, c),
                (FeatureSample::Categorical(r), FeatureSample::Categorical(c)) => chi_squared_test(r, c),
                _ => continue,
            };
            let Some(p_value) = p_value else { continue };

            signals.insert(feature.clone(), p_value);
            let weight = self.config.weight_of(feature);
            weighted_total += weight;
            if p_value < self.config.p_threshold {
                weighted_flagged += weight;
            }
        }

        if weighted_total <= 0.0 {
            return Ok(None);
        }
        let score = weighted_flagged / weighted_total;

        let key = (dataset_id.to_string(), kind.to_string());
        let mut entry = self.state.entry(key).or_default();

        if score < self.config.event_threshold - self.config.hysteresis_margin {
            entry.armed = false;
            return Ok(None);
        }
        if score < self.config.event_threshold {
            return Ok(None);
        }
        if entry.armed {
            return Ok(None);
        }
        entry.armed = true;

        if let Some(last) = entry.last_emitted_at {
            if Utc::now() - last < self.config.cooldown {
                return Ok(None);
            }
        }
        entry.last_emitted_at = Some(Utc::now());

        Ok(Some(RegimeEvent {
            event_id: Uuid::new_v4().to_string(),
            detected_at: Utc::now(),
            signals,
            kind: kind.to_string(),
            reference_window,
            current_window,
        }))
    }
}

/// Simplified ADWIN-style online detector over a scalar stream: on every
/// push it tries all split points in the current window and flags drift if
/// some prefix/suffix mean gap exceeds the point's Hoeffding-style bound,
/// then drops the stale prefix. This is an approximation of the published
/// ADWIN algorithm (it doesn't maintain the exponential bucket
/// compression), sized for a fast-path alert rather than a rigorous bound.
pub struct Adwin {
    window: VecDeque<f64>,
    delta: f64,
    max_size: usize,
}

impl Adwin {
    pub fn new(delta: f64, max_size: usize) -> Self {
        Self { window: VecDeque::new(), delta, max_size }
    }

    /// Push one value; returns `true` if drift was detected and the stale
    /// prefix of the window was dropped.
    pub fn push(&mut self, value: f64) -> bool {
        self.window.push_back(value);
        if self.window.len() > self.max_size {
            self.window.pop_front();
        }
        let len = self.window.len();
        if len < 4 {
            return false;
        }
        let values: Vec<f64> = self.window.iter().copied().collect();
        for cut in 1..len {
            let (left, right) = values.split_at(cut);
            let n0 = left.len() as f64;
            let n1 = right.len() as f64;
            let mean0 = left.iter().sum::<f64>() / n0;
            let mean1 = right.iter().sum::<f64>() / n1;
            let m = 1.0 / (1.0 / n0 + 1.0 / n1);
            let delta_prime = self.delta / len as f64;
            let epsilon = ((1.0 / (2.0 * m)) * (4.0 / delta_prime).ln()).sqrt();
            if (mean0 - mean1).abs() > epsilon {
                for _ in 0..cut {
                    self.window.pop_front();
                }
                return true;
            }
        }
        false
    }
}

/// KSWIN-style online detector: runs a two-sample KS test between the most
/// recent `stat_size` samples and the rest of a fixed-size sliding window.
pub struct Kswin {
    window: VecDeque<f64>,
    window_size: usize,
    stat_size: usize,
    alpha: f64,
}

impl Kswin {
    pub fn new(window_size: usize, stat_size: usize, alpha: f64) -> Self {
        Self { window: VecDeque::with_capacity(window_size), window_size, stat_size, alpha }
    }

    /// Push one value; returns `true` if the recent sub-window diverges
    /// from the rest of the window at `alpha` significance.
    pub fn push(&mut self, value: f64) -> bool {
        self.window.push_back(value);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }
        if self.window.len() < self.window_size {
            return false;
        }
        let all: Vec<f64> = self.window.iter().copied().collect();
        let split = all.len() - self.stat_size;
        let (reference, recent) = all.split_at(split);
        match ks_test(reference, recent) {
            Some(p) if p < self.alpha => {
                for _ in 0..self.stat_size {
                    self.window.pop_front();
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continuous(values: Vec<f64>) -> FeatureSample {
        FeatureSample::Continuous(values)
    }

    #[test]
    fn ks_test_same_distribution_has_high_p_value() {
        let a: Vec<f64> = (0..200).map(|i| i as f64 / 200.0).collect();
        let b = a.clone();
        let p = ks_test(&a, &b).unwrap();
        assert!(p > 0.9, "expected high p-value for identical samples, got {p}");
    }

    #[test]
    fn ks_test_shifted_distribution_has_low_p_value() {
        let a: Vec<f64> = (0..200).map(|i| i as f64 / 200.0).collect();
        let b: Vec<f64> = (0..200).map(|i| i as f64 / 200.0 + 5.0).collect();
        let p = ks_test(&a, &b).unwrap();
        assert!(p < 0.01, "expected low p-value for shifted samples, got {p}");
    }

    #[test]
    fn chi_squared_identical_proportions_has_high_p_value() {
        let mut reference = HashMap::new();
        reference.insert("a".to_string(), 500u64);
        reference.insert("b".to_string(), 500u64);
        let mut current = HashMap::new();
        current.insert("a".to_string(), 480u64);
        current.insert("b".to_string(), 520u64);
        let p = chi_squared_test(&reference, &current).unwrap();
        assert!(p > 0.05, "expected high p-value for near-identical proportions, got {p}");
    }

    #[test]
    fn chi_squared_skewed_proportions_has_low_p_value() {
        let mut reference = HashMap::new();
        reference.insert("a".to_string(), 500u64);
        reference.insert("b".to_string(), 500u64);
        let mut current = HashMap::new();
        current.insert("a".to_string(), 950u64);
        current.insert("b".to_string(), 50u64);
        let p = chi_squared_test(&reference, &current).unwrap();
        assert!(p < 0.001, "expected low p-value for skewed proportions, got {p}");
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (Utc::now(), Utc::now())
    }

    #[test]
    fn drift_detector_emits_once_then_debounces() {
        let mut importance = HashMap::new();
        importance.insert("b".to_string(), 1.0);
        let config = DriftConfig { p_threshold: 0.05, min_sample_size: 30, event_threshold: 0.5, hysteresis_margin: 0.1, cooldown: chrono::Duration::seconds(300), importance };
        let detector = DriftDetector::new(config);

        let reference_b: Vec<f64> = (0..200).map(|_| 0.0).collect();
        let current_b: Vec<f64> = (0..200).map(|_| 2.0).collect();
        let mut reference = HashMap::new();
        reference.insert("b".to_string(), continuous(reference_b));
        let mut current = HashMap::new();
        current.insert("b".to_string(), continuous(current_b));

        let first = detector.detect("ds", "mean_shift", &reference, &current, window(), window()).unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().kind, "mean_shift");

        let second = detector.detect("ds", "mean_shift", &reference, &current, window(), window()).unwrap();
        assert!(second.is_none(), "should be debounced while still armed and within cooldown");
    }

    #[test]
    fn drift_detector_ignores_features_below_min_sample_size() {
        let config = DriftConfig { min_sample_size: 1000, ..DriftConfig::default() };
        let detector = DriftDetector::new(config);
        let mut reference = HashMap::new();
        reference.insert("b".to_string(), continuous(vec![0.0; 10]));
        let mut current = HashMap::new();
        current.insert("b".to_string(), continuous(vec![5.0; 10]));
        let result = detector.detect("ds", "mean_shift", &reference, &current, window(), window()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn adwin_detects_a_mean_shift() {
        let mut adwin = Adwin::new(0.002, 200);
        let mut drift_seen = false;
        for _ in 0..100 {
            if adwin.push(0.0) {
                drift_seen = true;
            }
        }
        for _ in 0..100 {
            if adwin.push(10.0) {
                drift_seen = true;
            }
        }
        assert!(drift_seen);
    }

    #[test]
    fn kswin_detects_a_mean_shift() {
        let mut kswin = Kswin::new(60, 20, 0.05);
        let mut drift_seen = false;
        for _ in 0..40 {
            if kswin.push(0.0) {
                drift_seen = true;
            }
        }
        for _ in 0..40 {
            if kswin.push(10.0) {
                drift_seen = true;
            }
        }
        assert!(drift_seen);
    }
}
