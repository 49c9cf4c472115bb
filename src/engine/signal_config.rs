//! Versioned, sport-scoped scoring parameters.
//!
//! A `SignalConfig` is an explicit value passed into the scorer and the
//! classifier. Every persisted recommendation records the row id of the
//! config it was scored with, and new versions are only ever appended, so a
//! recommendation can always be reproduced from its inputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::movement::{MagnitudeBucket, TimingBucket};
use crate::db::models::StoredSignalConfig;
use crate::db::Database;
use crate::error::{EngineError, Result};

/// Fallback scope used when a sport has no config of its own.
pub const DEFAULT_SPORT: &str = "default";

/// Sports that get their own seeded config on first start.
pub const SEEDED_SPORTS: [&str; 5] = [DEFAULT_SPORT, "nfl", "nba", "mlb", "nhl"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementWeights {
    pub minimal: f64,
    pub small: f64,
    pub moderate: f64,
    pub large: f64,
    pub extreme: f64,
}

impl Default for MovementWeights {
    fn default() -> Self {
        MovementWeights {
            minimal: 0.0,
            small: 0.25,
            moderate: 0.5,
            large: 0.8,
            extreme: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWeights {
    pub early: f64,
    pub mid: f64,
    pub late: f64,
    pub closing: f64,
    pub live: f64,
    pub unknown: f64,
}

impl Default for TimeWeights {
    fn default() -> Self {
        TimeWeights {
            early: 0.5,
            mid: 0.75,
            late: 1.0,
            closing: 1.0,
            live: 0.25,
            unknown: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// signal name → weight
    pub weights: BTreeMap<String, f64>,
    pub movement_weights: MovementWeights,
    pub time_weights: TimeWeights,
    pub pick_threshold: f64,
    pub fade_threshold: f64,
    pub min_consensus_books: u32,
    /// Steepness of the confidence squash
    pub logistic_k: f64,
    pub steam_window_minutes: i64,
    pub steam_min_books: u32,
    /// Minimum per-book move (cents) inside the steam window
    pub steam_min_move: i32,
    /// UTC hour range `[start, end)` treated as early-morning
    pub early_morning_start_hour: u32,
    pub early_morning_end_hour: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        let weights = [
            ("reverse_line_movement", 1.5),
            ("steam_move", 1.5),
            ("late_money", 0.75),
            ("multi_book_consensus", 1.0),
            ("closing_line_value", 0.5),
            ("magnitude", 1.0),
            ("single_book_only", 1.5),
            ("price_only_move", 1.0),
            ("early_morning_move", 0.75),
            ("both_sides_moved", 1.25),
            ("juice_only_move", 0.75),
        ]
        .into_iter()
        .map(|(name, w)| (name.to_string(), w))
        .collect();

        SignalConfig {
            weights,
            movement_weights: MovementWeights::default(),
            time_weights: TimeWeights::default(),
            pick_threshold: 2.5,
            fade_threshold: 2.0,
            min_consensus_books: 3,
            logistic_k: 1.0,
            steam_window_minutes: 30,
            steam_min_books: 3,
            steam_min_move: 10,
            early_morning_start_hour: 8,
            early_morning_end_hour: 13,
        }
    }
}

impl SignalConfig {
    /// Built-in starting point for a sport. Scoring ranges differ between
    /// sports, so the squash steepness and thresholds differ too.
    pub fn for_sport(sport: &str) -> Self {
        let mut cfg = SignalConfig::default();
        match sport {
            "nfl" => {
                cfg.pick_threshold = 2.75;
                cfg.logistic_k = 0.9;
            }
            "nba" => {
                cfg.pick_threshold = 2.5;
                cfg.fade_threshold = 2.25;
                cfg.logistic_k = 1.1;
                cfg.steam_window_minutes = 20;
            }
            "mlb" => {
                // Moneyline-heavy: no point to move, so price carries more weight.
                cfg.movement_weights.small = 0.35;
                cfg.movement_weights.moderate = 0.6;
                cfg.logistic_k = 1.2;
            }
            "nhl" => {
                cfg.min_consensus_books = 2;
                cfg.logistic_k = 1.2;
            }
            _ => {}
        }
        cfg
    }

    /// Weight for a named signal; unknown signals weigh nothing.
    pub fn weight(&self, signal: &str) -> f64 {
        self.weights.get(signal).copied().unwrap_or(0.0)
    }

    pub fn movement_weight(&self, bucket: MagnitudeBucket) -> f64 {
        let w = &self.movement_weights;
        match bucket {
            MagnitudeBucket::Minimal => w.minimal,
            MagnitudeBucket::Small => w.small,
            MagnitudeBucket::Moderate => w.moderate,
            MagnitudeBucket::Large => w.large,
            MagnitudeBucket::Extreme => w.extreme,
        }
    }

    pub fn time_weight(&self, bucket: TimingBucket) -> f64 {
        let w = &self.time_weights;
        match bucket {
            TimingBucket::Early => w.early,
            TimingBucket::Mid => w.mid,
            TimingBucket::Late => w.late,
            TimingBucket::Closing => w.closing,
            TimingBucket::Live => w.live,
            TimingBucket::Unknown => w.unknown,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let finite_non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if let Some((name, w)) = self.weights.iter().find(|(_, w)| !finite_non_negative(**w)) {
            return Err(EngineError::InvalidInput(format!(
                "weight '{}' must be a finite non-negative number (got {})",
                name, w
            )));
        }
        if !(self.pick_threshold > 0.0 && self.pick_threshold.is_finite()) {
            return Err(EngineError::InvalidInput("pick_threshold must be positive".into()));
        }
        if !(self.fade_threshold > 0.0 && self.fade_threshold.is_finite()) {
            return Err(EngineError::InvalidInput("fade_threshold must be positive".into()));
        }
        if !(self.logistic_k > 0.0 && self.logistic_k.is_finite()) {
            return Err(EngineError::InvalidInput("logistic_k must be positive".into()));
        }
        if self.steam_window_minutes <= 0 {
            return Err(EngineError::InvalidInput(
                "steam_window_minutes must be positive".into(),
            ));
        }
        if self.early_morning_start_hour > 23 || self.early_morning_end_hour > 24 {
            return Err(EngineError::InvalidInput(
                "early-morning hours must be within a day".into(),
            ));
        }
        Ok(())
    }
}

/// Map feed sport keys ("basketball_nba") and casing variants onto the
/// short keys configs are scoped by.
pub fn normalize_sport(sport: &str) -> String {
    let s = sport.trim().to_lowercase();
    match s.as_str() {
        "americanfootball_nfl" | "american_football" => "nfl".to_string(),
        "basketball_nba" => "nba".to_string(),
        "baseball_mlb" => "mlb".to_string(),
        "icehockey_nhl" | "ice_hockey" => "nhl".to_string(),
        "" => DEFAULT_SPORT.to_string(),
        _ => s,
    }
}

/// Seed the built-in configs for any seeded sport that has none yet.
pub fn seed_defaults(db: &Database) -> Result<()> {
    for sport in SEEDED_SPORTS {
        if db.latest_signal_config(sport)?.is_none() {
            let stored = db.insert_signal_config(sport, "seed", &SignalConfig::for_sport(sport))?;
            info!("Seeded signal config for {} (id={})", sport, stored.id);
        }
    }
    Ok(())
}

/// Latest config for `sport`, falling back to the default scope. Never
/// fails for a missing config: an empty store gets the default seeded.
pub fn resolve_config(db: &Database, sport: &str) -> Result<StoredSignalConfig> {
    if let Some(cfg) = db.latest_signal_config(sport)? {
        return Ok(cfg);
    }
    debug!("{}; using default", EngineError::ConfigNotFound(sport.to_string()));
    if let Some(cfg) = db.latest_signal_config(DEFAULT_SPORT)? {
        return Ok(cfg);
    }
    db.insert_signal_config(DEFAULT_SPORT, "seed", &SignalConfig::default())
}
