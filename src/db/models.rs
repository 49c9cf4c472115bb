use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::engine::signal_config::SignalConfig;

/// Identity of a single bettable line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketKey {
    pub event_id: String,
    pub sport: String,
    pub bookmaker: String,
    /// e.g. "h2h" | "spreads" | "totals" | "player_points"
    pub market_type: String,
    pub outcome_name: String,
    #[serde(default)]
    pub player_name: Option<String>,
}

impl MarketKey {
    /// Canonical storage id: `event|bookmaker|market|outcome|player`.
    pub fn id(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.event_id,
            self.bookmaker,
            self.market_type,
            self.outcome_name,
            self.player_name.as_deref().unwrap_or("")
        )
    }

    /// Trim every component and lowercase the sport, bookmaker and market type.
    pub fn normalized(&self) -> Self {
        MarketKey {
            event_id: self.event_id.trim().to_string(),
            sport: crate::engine::signal_config::normalize_sport(&self.sport),
            bookmaker: self.bookmaker.trim().to_lowercase(),
            market_type: self.market_type.trim().to_lowercase(),
            outcome_name: self.outcome_name.trim().to_string(),
            player_name: self
                .player_name
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string),
        }
    }
}

/// One observed price/line for a market key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub market_key: String,
    /// American odds, e.g. -110 or +145
    pub price: i32,
    /// Spread/total line; `None` for moneyline markets
    pub point: Option<f64>,
    pub captured_at: DateTime<Utc>,
    /// Share of public tickets (0–100) on this outcome, when the feed has it
    pub public_ticket_pct: Option<f64>,
}

/// Event-level metadata shared by every market key of a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub sport: String,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub commence_time: Option<DateTime<Utc>>,
}

/// Final score of a completed event, used to grade recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalScore {
    pub event_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: i32,
    pub away_score: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Pick,
    Fade,
    Caution,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Pick => "PICK",
            Classification::Fade => "FADE",
            Classification::Caution => "CAUTION",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PICK" => Ok(Classification::Pick),
            "FADE" => Ok(Classification::Fade),
            "CAUTION" => Ok(Classification::Caution),
            other => Err(format!("unknown classification '{}'", other)),
        }
    }
}

/// Realised result of the scored outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualResult {
    Win,
    Loss,
    Push,
}

impl ActualResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualResult::Win => "win",
            ActualResult::Loss => "loss",
            ActualResult::Push => "push",
        }
    }
}

impl FromStr for ActualResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "win" => Ok(ActualResult::Win),
            "loss" => Ok(ActualResult::Loss),
            "push" => Ok(ActualResult::Push),
            other => Err(format!("unknown result '{}'", other)),
        }
    }
}

/// Output of one scoring pass for one market key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecommendation {
    pub id: Option<i64>,
    pub market_key: String,
    pub event_id: String,
    pub sport: String,
    pub sharp_score: f64,
    pub trap_score: f64,
    pub signals_detected: Vec<String>,
    pub classification: Classification,
    /// Stated probability (0–1) that the scored outcome wins
    pub confidence: f64,
    pub books_reporting: i64,
    pub price_delta: i32,
    pub point_delta: Option<f64>,
    pub magnitude: String,
    pub timing: String,
    /// Row id of the signal config used for scoring
    pub signal_config_version: i64,
    pub scored_at: DateTime<Utc>,
    pub actual_result: Option<ActualResult>,
    pub correct: Option<bool>,
    pub verified_at: Option<DateTime<Utc>>,
    /// A later pass on the same key was graded instead of this one
    #[serde(default)]
    pub superseded: bool,
}

/// Outcome fields attached to a recommendation exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedOutcome {
    pub recommendation_id: i64,
    pub actual_result: ActualResult,
    pub correct: bool,
    pub verified_at: DateTime<Utc>,
}

/// Accumulated accuracy for one confidence range of one sport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub sport: String,
    pub bucket_lo: f64,
    pub bucket_hi: f64,
    /// "low" | "medium" | "high"
    pub confidence_level: String,
    pub sample_size: i64,
    pub hits: i64,
    pub sum_confidence: f64,
    pub sum_squared_error: f64,
    pub updated_at: DateTime<Utc>,
}

/// Single verified sample fed into a calibration bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketIncrement {
    pub sport: String,
    pub bucket_lo: f64,
    pub bucket_hi: f64,
    pub confidence_level: String,
    pub hit: bool,
    pub confidence: f64,
}

/// Verified (non-push) recommendation as seen by the calibration pass.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedSample {
    pub confidence: f64,
    pub won: bool,
    pub classification: Classification,
    pub signals: Vec<String>,
}

/// A persisted signal config version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignalConfig {
    /// Row id; this is what recommendations reference
    pub id: i64,
    pub sport: String,
    /// Per-sport version counter
    pub version: i64,
    /// "seed" | "operator" | "calibration"
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub config: SignalConfig,
}
