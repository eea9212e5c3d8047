//! Per-(scanner, metric) running statistics with anomaly and drift tests.
//!
//! Baselines use Welford's online algorithm so mean and variance stay exact
//! without retaining the full history; a bounded ring of recent samples
//! backs the IQR test. Every update is persisted to the `baselines` bucket.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, Store};

const BASELINE_BUCKET: &str = "baselines";
const MAX_SAMPLES: usize = 200;
const MIN_SAMPLES: u64 = 10;
const ZSCORE_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub scanner_name: String,
    pub metric: String,
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: f64,
    pub max: f64,
    pub samples: VecDeque<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Baseline {
    fn seed(scanner_name: &str, metric: &str, value: f64) -> Self {
        Self {
            scanner_name: scanner_name.to_string(),
            metric: metric.to_string(),
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: value,
            max: value,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            updated_at: Utc::now(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;

        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }

        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.updated_at = Utc::now();
    }

    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }

    fn z_score(&self, value: f64) -> f64 {
        let variance = self.sample_variance();
        if variance <= 0.0 {
            return 0.0;
        }
        (value - self.mean) / variance.sqrt()
    }
}

/// Owns all baselines; every mutation goes through here.
pub struct BaselineManager {
    store: Arc<dyn Store>,
    drift_counters: Mutex<HashMap<String, u32>>,
}

impl BaselineManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            drift_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Folds `value` into the baseline and persists it.
    pub fn update(
        &self,
        scanner_name: &str,
        metric: &str,
        value: f64,
    ) -> Result<Baseline, StorageError> {
        if scanner_name.is_empty() || metric.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let mut baseline = match self.get(scanner_name, metric) {
            Ok(b) => b,
            Err(StorageError::NotFound) => Baseline::seed(scanner_name, metric, value),
            Err(e) => return Err(e),
        };
        baseline.observe(value);
        self.put(&baseline)?;
        Ok(baseline)
    }

    /// Tests `value` against the stored baseline without updating it.
    /// Returns the verdict plus a reason string for evidence.
    pub fn is_anomaly(
        &self,
        scanner_name: &str,
        metric: &str,
        value: f64,
    ) -> Result<(bool, String), StorageError> {
        let baseline = self.get(scanner_name, metric)?;
        if baseline.count < MIN_SAMPLES {
            return Ok((false, "insufficient_samples".to_string()));
        }

        // A flat baseline has no spread to test against: the z-score is
        // reported as 0 and the IQR test is skipped.
        if baseline.sample_variance() <= 0.0 {
            return Ok((false, "within_baseline".to_string()));
        }

        let z = baseline.z_score(value);
        if z.abs() >= ZSCORE_THRESHOLD {
            return Ok((true, format!("zscore={z:.2}")));
        }

        let (q1, q3) = quartiles(&baseline.samples);
        let iqr = q3 - q1;
        let low = q1 - 1.5 * iqr;
        let high = q3 + 1.5 * iqr;
        if value < low || value > high {
            return Ok((true, format!("iqr_outlier ({low:.2}..{high:.2})")));
        }

        Ok((false, "within_baseline".to_string()))
    }

    /// Counts contiguous anomalies per (scanner, metric); reports drift once
    /// the streak reaches `consecutive` and resets the streak on report.
    pub fn detect_drift(
        &self,
        scanner_name: &str,
        metric: &str,
        value: f64,
        consecutive: u32,
    ) -> Result<(bool, u32), StorageError> {
        let anomalous = match self.is_anomaly(scanner_name, metric, value) {
            Ok((hit, _)) => hit,
            Err(StorageError::NotFound) => false,
            Err(e) => return Err(e),
        };

        let key = baseline_key(scanner_name, metric);
        let mut counters = self
            .drift_counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let streak = counters.entry(key).or_insert(0);
        if !anomalous {
            *streak = 0;
            return Ok((false, 0));
        }
        *streak += 1;
        if *streak >= consecutive.max(1) {
            *streak = 0;
            return Ok((true, 0));
        }
        Ok((false, *streak))
    }

    pub fn get(&self, scanner_name: &str, metric: &str) -> Result<Baseline, StorageError> {
        let raw = self
            .store
            .get(BASELINE_BUCKET, &baseline_key(scanner_name, metric))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn list(&self) -> Result<Vec<Baseline>, StorageError> {
        let mut out = Vec::new();
        let walk = self.store.for_each(BASELINE_BUCKET, &mut |_key, value| {
            let baseline: Baseline = serde_json::from_slice(value)?;
            out.push(baseline);
            Ok(())
        });
        match walk {
            Ok(()) | Err(StorageError::NotFound) => Ok(out),
            Err(e) => Err(e),
        }
    }

    /// Drops baselines not updated since `cutoff`.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<(), StorageError> {
        let mut stale = Vec::new();
        self.store.for_each(BASELINE_BUCKET, &mut |key, value| {
            let Ok(baseline) = serde_json::from_slice::<Baseline>(value) else {
                return Ok(());
            };
            if baseline.updated_at < cutoff {
                stale.push(key.to_string());
            }
            Ok(())
        })?;
        for key in stale {
            self.store.delete(BASELINE_BUCKET, &key)?;
        }
        Ok(())
    }

    fn put(&self, baseline: &Baseline) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(baseline)?;
        self.store.put(
            BASELINE_BUCKET,
            &baseline_key(&baseline.scanner_name, &baseline.metric),
            &raw,
        )
    }
}

fn baseline_key(scanner_name: &str, metric: &str) -> String {
    format!("{scanner_name}::{metric}")
}

/// Q1/Q3 by linear-interpolation percentile over the samples ring.
fn quartiles(samples: &VecDeque<f64>) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    (percentile(&sorted, 25.0), percentile(&sorted, 75.0))
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 100.0 {
        return sorted[sorted.len() - 1];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, BaselineManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::open(&dir.path().join("kv"), "").unwrap();
        (dir, BaselineManager::new(store))
    }

    #[test]
    fn welford_matches_direct_computation() {
        let (_dir, mgr) = manager();
        let values = [4.0, 7.0, 13.0, 16.0, 10.0, 10.0];
        for v in values {
            mgr.update("s", "m", v).unwrap();
        }
        let b = mgr.get("s", "m").unwrap();

        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let variance: f64 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (values.len() - 1) as f64;

        assert_eq!(b.count, values.len() as u64);
        assert!((b.mean - mean).abs() < 1e-9);
        assert!((b.sample_variance() - variance).abs() < 1e-9);
        assert_eq!(b.min, 4.0);
        assert_eq!(b.max, 16.0);
        assert_eq!(b.samples.len(), values.len());
    }

    #[test]
    fn single_sample_seeds_min_max() {
        let (_dir, mgr) = manager();
        let b = mgr.update("s", "m", 42.0).unwrap();
        assert_eq!(b.count, 1);
        assert_eq!(b.min, 42.0);
        assert_eq!(b.max, 42.0);
        assert_eq!(b.sample_variance(), 0.0);
    }

    #[test]
    fn samples_ring_is_bounded() {
        let (_dir, mgr) = manager();
        for i in 0..250 {
            mgr.update("s", "m", i as f64).unwrap();
        }
        let b = mgr.get("s", "m").unwrap();
        assert_eq!(b.count, 250);
        assert_eq!(b.samples.len(), MAX_SAMPLES);
        // Most recent 200 kept.
        assert_eq!(*b.samples.front().unwrap(), 50.0);
        assert_eq!(*b.samples.back().unwrap(), 249.0);
    }

    #[test]
    fn empty_scanner_or_metric_rejected() {
        let (_dir, mgr) = manager();
        assert!(mgr.update("", "m", 1.0).is_err());
        assert!(mgr.update("s", "", 1.0).is_err());
    }

    #[test]
    fn anomaly_needs_min_samples() {
        let (_dir, mgr) = manager();
        for _ in 0..5 {
            mgr.update("s", "m", 10.0).unwrap();
        }
        let (hit, reason) = mgr.is_anomaly("s", "m", 1000.0).unwrap();
        assert!(!hit);
        assert_eq!(reason, "insufficient_samples");
    }

    #[test]
    fn extreme_value_is_zscore_anomaly() {
        let (_dir, mgr) = manager();
        for i in 0..20 {
            mgr.update("s", "m", (10 + i % 3) as f64).unwrap();
        }
        let (hit, reason) = mgr.is_anomaly("s", "m", 1000.0).unwrap();
        assert!(hit);
        assert!(reason.starts_with("zscore="), "reason: {reason}");
    }

    #[test]
    fn in_range_value_is_within_baseline() {
        let (_dir, mgr) = manager();
        for i in 0..20 {
            mgr.update("s", "m", (10 + i % 3) as f64).unwrap();
        }
        let (hit, reason) = mgr.is_anomaly("s", "m", 11.0).unwrap();
        assert!(!hit);
        assert_eq!(reason, "within_baseline");
    }

    #[test]
    fn zero_variance_skips_both_tests() {
        let (_dir, mgr) = manager();
        for _ in 0..20 {
            mgr.update("s", "m", 10.0).unwrap();
        }
        let (hit, reason) = mgr.is_anomaly("s", "m", 11.0).unwrap();
        assert!(!hit);
        assert_eq!(reason, "within_baseline");
    }

    #[test]
    fn drift_requires_consecutive_anomalies() {
        let (_dir, mgr) = manager();
        for i in 0..20 {
            mgr.update("s", "m", (10 + i % 3) as f64).unwrap();
        }

        let (drift, streak) = mgr.detect_drift("s", "m", 1000.0, 3).unwrap();
        assert!(!drift);
        assert_eq!(streak, 1);

        // A normal value resets the streak.
        let (drift, streak) = mgr.detect_drift("s", "m", 11.0, 3).unwrap();
        assert!(!drift);
        assert_eq!(streak, 0);

        mgr.detect_drift("s", "m", 1000.0, 3).unwrap();
        mgr.detect_drift("s", "m", 1000.0, 3).unwrap();
        let (drift, streak) = mgr.detect_drift("s", "m", 1000.0, 3).unwrap();
        assert!(drift);
        assert_eq!(streak, 0);
    }

    #[test]
    fn drift_on_unknown_baseline_is_false() {
        let (_dir, mgr) = manager();
        let (drift, streak) = mgr.detect_drift("s", "m", 1.0, 3).unwrap();
        assert!(!drift);
        assert_eq!(streak, 0);
    }

    #[test]
    fn prune_drops_stale_baselines() {
        let (_dir, mgr) = manager();
        mgr.update("s", "m", 1.0).unwrap();
        assert_eq!(mgr.list().unwrap().len(), 1);
        mgr.prune_older_than(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert!(mgr.list().unwrap().is_empty());
    }
}
