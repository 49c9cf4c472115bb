//! Bucketed confidence calibration and feedback into signal configs.
//!
//! Verified outcomes are grouped into fixed-width confidence buckets. Each
//! bucket reports its empirical hit rate, Brier score and calibration error,
//! and (once it holds enough samples) a ratio-based calibration factor
//! `hit_rate / bucket_midpoint`. Eligible buckets drive a damped adjustment
//! of the sport's `logistic_k`, signal weights and pick/fade thresholds,
//! written as a new config version.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::signal_config::{resolve_config, SignalConfig};
use super::signals::{SignalProvider, SignalSide};
use crate::db::models::{CalibrationBucket, Classification, VerifiedSample};
use crate::db::Database;
use crate::error::{EngineError, Result};

const MIN_LOGISTIC_K: f64 = 0.1;
const MAX_LOGISTIC_K: f64 = 5.0;
const MIN_WEIGHT: f64 = 0.05;
const MAX_WEIGHT: f64 = 5.0;
const MIN_THRESHOLD: f64 = 0.25;
const MAX_THRESHOLD: f64 = 20.0;
/// Bound on any single multiplicative factor before damping.
const FACTOR_FLOOR: f64 = 0.5;
const FACTOR_CAP: f64 = 1.5;
/// Accuracy above target by more than this lowers a threshold.
const TARGET_MARGIN: f64 = 0.05;

/// Ratio with a defined neutral value instead of NaN/inf.
pub fn safe_ratio(num: f64, den: f64, neutral: f64) -> f64 {
    if den == 0.0 || !den.is_finite() || !num.is_finite() {
        return neutral;
    }
    let r = num / den;
    if r.is_finite() {
        r
    } else {
        neutral
    }
}

/// Index of the fixed-width bucket holding `confidence`.
pub fn bucket_index(confidence: f64, buckets: usize) -> usize {
    let n = buckets.max(1);
    let c = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.5 };
    ((c * n as f64).floor() as usize).min(n - 1)
}

/// `[lo, hi)` bounds of bucket `idx`, rounded so they key stably.
pub fn bucket_range(idx: usize, buckets: usize) -> (f64, f64) {
    let n = buckets.max(1) as f64;
    let round = |v: f64| (v * 10_000.0).round() / 10_000.0;
    (round(idx as f64 / n), round((idx + 1) as f64 / n))
}

/// Label by how far the bucket midpoint sits from a coin flip.
pub fn confidence_level(lo: f64, hi: f64) -> &'static str {
    let distance = ((lo + hi) / 2.0 - 0.5).abs();
    if distance < 0.1 {
        "low"
    } else if distance < 0.25 {
        "medium"
    } else {
        "high"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub buckets: usize,
    pub min_bucket_samples: i64,
    pub learning_rate: f64,
    pub pick_target_accuracy: f64,
    pub fade_target_accuracy: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        CalibrationParams {
            buckets: 10,
            min_bucket_samples: 5,
            learning_rate: 0.25,
            pick_target_accuracy: 0.55,
            fade_target_accuracy: 0.55,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRange {
    pub lo: f64,
    pub hi: f64,
}

impl BucketRange {
    pub fn midpoint(&self) -> f64 {
        (self.lo + self.hi) / 2.0
    }
}

/// Derived statistics for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub range: BucketRange,
    pub confidence_level: String,
    pub sample_size: i64,
    pub hits: i64,
    pub empirical_hit_rate: f64,
    pub mean_confidence: f64,
    pub brier_score: f64,
    pub calibration_error: f64,
    /// `None` below the minimum sample size
    pub calibration_factor: Option<f64>,
}

pub fn bucket_stats(bucket: &CalibrationBucket, min_samples: i64) -> BucketStats {
    let n = bucket.sample_size.max(0) as f64;
    let range = BucketRange {
        lo: bucket.bucket_lo,
        hi: bucket.bucket_hi,
    };
    let hit_rate = safe_ratio(bucket.hits as f64, n, 0.0).clamp(0.0, 1.0);
    let mean_confidence = safe_ratio(bucket.sum_confidence, n, 0.0);
    let brier = safe_ratio(bucket.sum_squared_error, n, 0.0);
    let calibration_factor = if bucket.sample_size >= min_samples.max(1) {
        Some(safe_ratio(hit_rate, range.midpoint(), 1.0))
    } else {
        None
    };
    BucketStats {
        confidence_level: bucket.confidence_level.clone(),
        sample_size: bucket.sample_size,
        hits: bucket.hits,
        empirical_hit_rate: hit_rate,
        mean_confidence,
        brier_score: brier,
        calibration_error: if bucket.sample_size > 0 {
            (hit_rate - mean_confidence).abs()
        } else {
            0.0
        },
        calibration_factor,
        range,
    }
}

/// Aggregate the samples that fall into bucket `idx` of `buckets`.
pub fn rebuild_bucket(
    sport: &str,
    samples: &[VerifiedSample],
    idx: usize,
    buckets: usize,
) -> CalibrationBucket {
    let n = buckets.max(1);
    let (lo, hi) = bucket_range(idx, n);
    let mut b = CalibrationBucket {
        sport: sport.to_string(),
        bucket_lo: lo,
        bucket_hi: hi,
        confidence_level: confidence_level(lo, hi).to_string(),
        sample_size: 0,
        hits: 0,
        sum_confidence: 0.0,
        sum_squared_error: 0.0,
        updated_at: Utc::now(),
    };
    for s in samples.iter().filter(|s| bucket_index(s.confidence, n) == idx) {
        let y = if s.won { 1.0 } else { 0.0 };
        b.sample_size += 1;
        b.hits += s.won as i64;
        b.sum_confidence += s.confidence;
        b.sum_squared_error += (s.confidence - y).powi(2);
    }
    b
}

/// A derived config plus a human-readable list of what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub config: SignalConfig,
    pub changes: Vec<String>,
}

fn damp(value: f64, factor: f64, learning_rate: f64) -> f64 {
    let f = factor.clamp(FACTOR_FLOOR, FACTOR_CAP);
    value * (1.0 + learning_rate * (f - 1.0))
}

/// Derive the next config from eligible buckets and per-signal accuracy.
///
/// Only samples whose confidence lands in an eligible bucket feed the
/// weight and threshold updates; the rest only accumulate. Returns
/// `InsufficientSample` when no bucket meets the minimum sample size;
/// callers keep the current config in that case.
pub fn derive_adjustment(
    sport: &str,
    current: &SignalConfig,
    stats: &[BucketStats],
    samples: &[VerifiedSample],
    provider: &dyn SignalProvider,
    params: &CalibrationParams,
) -> Result<Adjustment> {
    let eligible: Vec<&BucketStats> = stats
        .iter()
        .filter(|b| b.calibration_factor.is_some())
        .collect();
    if eligible.is_empty() {
        return Err(EngineError::InsufficientSample {
            sport: sport.to_string(),
            eligible: 0,
        });
    }

    let n_buckets = params.buckets.max(1);
    let eligible_idx: Vec<usize> = eligible
        .iter()
        .map(|b| bucket_index(b.range.midpoint(), n_buckets))
        .collect();
    let samples: Vec<&VerifiedSample> = samples
        .iter()
        .filter(|s| eligible_idx.contains(&bucket_index(s.confidence, n_buckets)))
        .collect();

    let lr = params.learning_rate;
    let min_n = params.min_bucket_samples.max(1) as usize;
    let mut next = current.clone();
    let mut changes = Vec::new();

    // Sharpness: how far outcomes actually sit from a coin flip relative to
    // how far confidence claimed they would. Below 1 means overconfident.
    let mut weighted = 0.0;
    let mut total = 0.0;
    for b in &eligible {
        let offset = b.range.midpoint() - 0.5;
        if offset.abs() < 1e-9 {
            continue;
        }
        let n = b.sample_size as f64;
        weighted += n * safe_ratio(b.empirical_hit_rate - 0.5, offset, 1.0);
        total += n;
    }
    let sharpness = safe_ratio(weighted, total, 1.0);
    let k = damp(current.logistic_k, sharpness, lr).clamp(MIN_LOGISTIC_K, MAX_LOGISTIC_K);
    if (k - current.logistic_k).abs() > 1e-9 {
        changes.push(format!(
            "logistic_k {:.4} -> {:.4} (sharpness {:.3})",
            current.logistic_k, k, sharpness
        ));
        next.logistic_k = k;
    }

    // Per-signal weight factors.
    for (name, weight) in current.weights.iter() {
        // Base magnitude term fires on every supported move.
        if name == "magnitude" {
            continue;
        }
        let Some(side) = provider.side_of(name) else {
            continue;
        };
        let fired: Vec<&VerifiedSample> = samples
            .iter()
            .copied()
            .filter(|s| s.signals.iter().any(|sig| sig == name))
            .collect();
        if fired.len() < min_n {
            continue;
        }
        let n = fired.len() as f64;
        let wins = fired.iter().filter(|s| s.won).count() as f64;
        let mean_conf = fired.iter().map(|s| s.confidence).sum::<f64>() / n;
        let factor = match side {
            SignalSide::Sharp => safe_ratio(wins / n, mean_conf, 1.0),
            SignalSide::Trap => safe_ratio((n - wins) / n, 1.0 - mean_conf, 1.0),
        };
        let w = damp(*weight, factor, lr).clamp(MIN_WEIGHT, MAX_WEIGHT);
        if (w - weight).abs() > 1e-9 {
            changes.push(format!("weight {} {:.4} -> {:.4} (factor {:.3})", name, weight, w, factor));
            next.weights.insert(name.clone(), w);
        }
    }

    // Thresholds: demand more evidence when a class underperforms.
    let accuracy = |class: Classification| -> Option<f64> {
        let of_class: Vec<&VerifiedSample> = samples
            .iter()
            .copied()
            .filter(|s| s.classification == class)
            .collect();
        if of_class.len() < min_n {
            return None;
        }
        let correct = of_class
            .iter()
            .filter(|s| match class {
                Classification::Fade => !s.won,
                _ => s.won,
            })
            .count();
        Some(correct as f64 / of_class.len() as f64)
    };
    let nudge = |threshold: f64, acc: f64, target: f64| -> f64 {
        if acc < target || acc > target + TARGET_MARGIN {
            (threshold * (1.0 + lr * (target - acc))).clamp(MIN_THRESHOLD, MAX_THRESHOLD)
        } else {
            threshold
        }
    };
    if let Some(acc) = accuracy(Classification::Pick) {
        let t = nudge(current.pick_threshold, acc, params.pick_target_accuracy);
        if (t - current.pick_threshold).abs() > 1e-9 {
            changes.push(format!(
                "pick_threshold {:.4} -> {:.4} (accuracy {:.3})",
                current.pick_threshold, t, acc
            ));
            next.pick_threshold = t;
        }
    }
    if let Some(acc) = accuracy(Classification::Fade) {
        let t = nudge(current.fade_threshold, acc, params.fade_target_accuracy);
        if (t - current.fade_threshold).abs() > 1e-9 {
            changes.push(format!(
                "fade_threshold {:.4} -> {:.4} (accuracy {:.3})",
                current.fade_threshold, t, acc
            ));
            next.fade_threshold = t;
        }
    }

    Ok(Adjustment {
        config: next,
        changes,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub sport: String,
    pub buckets: Vec<BucketStats>,
    pub samples: i64,
    pub overall_brier: f64,
    /// No bucket had enough samples to drive an update
    pub low_confidence: bool,
    /// Config the report was computed against
    pub signal_config_version: i64,
    /// New version written by this run, if any
    pub new_signal_config_version: Option<i64>,
    pub changes: Vec<String>,
}

fn summarize(sport: &str, stats: Vec<BucketStats>, min_samples: i64, config_id: i64) -> CalibrationReport {
    let samples: i64 = stats.iter().map(|b| b.sample_size).sum();
    let sse: f64 = stats
        .iter()
        .map(|b| b.brier_score * b.sample_size as f64)
        .sum();
    let low_confidence = !stats.iter().any(|b| b.sample_size >= min_samples.max(1));
    CalibrationReport {
        sport: sport.to_string(),
        buckets: stats,
        samples,
        overall_brier: safe_ratio(sse, samples as f64, 0.0),
        low_confidence,
        signal_config_version: config_id,
        new_signal_config_version: None,
        changes: Vec::new(),
    }
}

/// Periodic batch calibrator. One run per sport at a time; different
/// sports may run concurrently.
pub struct Calibrator {
    db: Database,
    provider: Arc<dyn SignalProvider>,
    params: CalibrationParams,
    sport_locks: DashMap<String, Arc<Mutex<()>>>,
    abort: Arc<AtomicBool>,
}

impl Calibrator {
    pub fn new(db: Database, provider: Arc<dyn SignalProvider>, params: CalibrationParams) -> Self {
        Calibrator {
            db,
            provider,
            params,
            sport_locks: DashMap::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag; setting it stops in-flight runs between buckets.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Current bucket state for a sport without writing anything.
    pub fn report(&self, sport: &str) -> Result<CalibrationReport> {
        let stats: Vec<BucketStats> = self
            .db
            .list_calibration_buckets(sport)?
            .iter()
            .map(|b| bucket_stats(b, self.params.min_bucket_samples))
            .collect();
        let cfg = resolve_config(&self.db, sport)?;
        Ok(summarize(sport, stats, self.params.min_bucket_samples, cfg.id))
    }

    /// Rebuild buckets from verified outcomes and write an adjusted config.
    pub async fn run(&self, sport: &str) -> Result<CalibrationReport> {
        let lock = self.sport_locks.entry(sport.to_string()).or_default().clone();
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| EngineError::CalibrationInProgress(sport.to_string()))?;

        let n = self.params.buckets.max(1);
        let mut rebuilt = Vec::with_capacity(n);
        for idx in 0..n {
            if self.abort.load(Ordering::SeqCst) {
                warn!("Calibration for {} aborted after {} bucket(s)", sport, idx);
                return Err(EngineError::CalibrationAborted {
                    sport: sport.to_string(),
                    committed: idx,
                });
            }
            let bucket = self
                .db
                .rebuild_calibration_bucket(sport, |samples| rebuild_bucket(sport, samples, idx, n))?;
            rebuilt.push(bucket);
            tokio::task::yield_now().await;
        }
        let samples = self.db.list_verified_samples(sport)?;

        let stats: Vec<BucketStats> = rebuilt
            .iter()
            .map(|b| bucket_stats(b, self.params.min_bucket_samples))
            .collect();
        let current = resolve_config(&self.db, sport)?;
        let mut report = summarize(sport, stats, self.params.min_bucket_samples, current.id);

        match derive_adjustment(
            sport,
            &current.config,
            &report.buckets,
            &samples,
            self.provider.as_ref(),
            &self.params,
        ) {
            Ok(adj) if adj.changes.is_empty() => {
                debug!("Calibration for {}: config unchanged", sport);
            }
            Ok(adj) => {
                let stored = self.db.insert_signal_config(sport, "calibration", &adj.config)?;
                info!(
                    "Calibration wrote {} config v{} (id={}): {}",
                    sport,
                    stored.version,
                    stored.id,
                    adj.changes.join("; ")
                );
                report.new_signal_config_version = Some(stored.id);
                report.changes = adj.changes;
            }
            Err(e @ EngineError::InsufficientSample { .. }) => {
                info!("Calibration skipped update: {}", e);
                report.low_confidence = true;
            }
            Err(e) => return Err(e),
        }

        info!(
            "Calibration for {}: samples={}, brier={:.4}, low_confidence={}",
            sport, report.samples, report.overall_brier, report.low_confidence
        );
        Ok(report)
    }
}
