//! Opening-to-current line movement for a single market key.
//!
//! A [`Movement`] is never stored: it is recomputed from the opening and
//! latest snapshots whenever a key is scored, so it carries no hidden state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::Snapshot;

/// Magnitude bucket lower bounds, in cents of American odds.
pub const SMALL_THRESHOLD: i32 = 10;
pub const MODERATE_THRESHOLD: i32 = 15;
pub const LARGE_THRESHOLD: i32 = 30;
pub const EXTREME_THRESHOLD: i32 = 50;

/// Largest accepted price magnitude; anything beyond is a feed error.
pub const MAX_PRICE_MAGNITUDE: u32 = 100_000;

/// Point changes smaller than this count as "unchanged".
const POINT_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagnitudeBucket {
    Minimal,
    Small,
    Moderate,
    Large,
    Extreme,
}

impl MagnitudeBucket {
    pub fn from_delta(price_delta: i32) -> Self {
        match price_delta.unsigned_abs() as i64 {
            d if d >= EXTREME_THRESHOLD as i64 => MagnitudeBucket::Extreme,
            d if d >= LARGE_THRESHOLD as i64 => MagnitudeBucket::Large,
            d if d >= MODERATE_THRESHOLD as i64 => MagnitudeBucket::Moderate,
            d if d >= SMALL_THRESHOLD as i64 => MagnitudeBucket::Small,
            _ => MagnitudeBucket::Minimal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MagnitudeBucket::Minimal => "minimal",
            MagnitudeBucket::Small => "small",
            MagnitudeBucket::Moderate => "moderate",
            MagnitudeBucket::Large => "large",
            MagnitudeBucket::Extreme => "extreme",
        }
    }
}

/// Position of the latest observation relative to event start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingBucket {
    /// More than 6h before commence
    Early,
    /// 3–6h before
    Mid,
    /// 1–3h before
    Late,
    /// Under an hour before
    Closing,
    /// At or after commence
    Live,
    /// No commence time known
    Unknown,
}

impl TimingBucket {
    pub fn classify(observed_at: DateTime<Utc>, commence_time: Option<DateTime<Utc>>) -> Self {
        let Some(commence) = commence_time else {
            return TimingBucket::Unknown;
        };
        let minutes = (commence - observed_at).num_minutes();
        match minutes {
            m if m <= 0 => TimingBucket::Live,
            m if m > 6 * 60 => TimingBucket::Early,
            m if m > 3 * 60 => TimingBucket::Mid,
            m if m >= 60 => TimingBucket::Late,
            _ => TimingBucket::Closing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimingBucket::Early => "early",
            TimingBucket::Mid => "mid",
            TimingBucket::Late => "late",
            TimingBucket::Closing => "closing",
            TimingBucket::Live => "live",
            TimingBucket::Unknown => "unknown",
        }
    }

    pub fn is_late(&self) -> bool {
        matches!(self, TimingBucket::Late | TimingBucket::Closing)
    }
}

/// Place American odds on a continuous line so that moves across even money
/// measure correctly: -105 → +105 is 10 cents, not 210.
pub fn price_to_cents(price: i32) -> i32 {
    if price >= 100 {
        price - 100
    } else if price <= -100 {
        price + 100
    } else {
        // Not valid American odds; treat as even money.
        0
    }
}

/// Signed distance from `from` to `to` on the cents line. Saturates
/// symmetrically so `abs()` on the result can never overflow.
pub fn cents_delta(from: i32, to: i32) -> i32 {
    let d = price_to_cents(to) as i64 - price_to_cents(from) as i64;
    d.clamp(-(i32::MAX as i64), i32::MAX as i64) as i32
}

/// Implied win probability of American odds (vig included).
pub fn implied_probability(price: i32) -> f64 {
    let p = price as f64;
    if price <= -100 {
        -p / (-p + 100.0)
    } else if price >= 100 {
        100.0 / (p + 100.0)
    } else {
        0.5
    }
}

/// Valid American odds have magnitude between 100 and
/// [`MAX_PRICE_MAGNITUDE`].
pub fn is_valid_price(price: i32) -> bool {
    (100..=MAX_PRICE_MAGNITUDE).contains(&price.unsigned_abs())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub market_key: String,
    pub market_type: String,
    pub outcome_name: String,
    pub opening: Snapshot,
    pub latest: Snapshot,
    /// Latest minus opening in cents; negative means the outcome got shorter
    pub price_delta: i32,
    /// `None` when either snapshot has no point
    pub point_delta: Option<f64>,
    pub implied_prob_delta: f64,
    pub magnitude: MagnitudeBucket,
    pub timing: TimingBucket,
}

impl Movement {
    pub fn price_moved(&self) -> bool {
        self.price_delta != 0
    }

    /// `None` when the point cannot be compared.
    pub fn point_moved(&self) -> Option<bool> {
        self.point_delta.map(|d| d.abs() > POINT_EPS)
    }

    /// +1 when the market moved toward this outcome, -1 when away from it,
    /// 0 when flat. Price decides; the point breaks a flat price.
    pub fn support(&self) -> i32 {
        if self.price_delta != 0 {
            return -self.price_delta.signum();
        }
        match self.point_delta {
            Some(d) if d.abs() > POINT_EPS => point_support(&self.market_type, &self.outcome_name, d),
            _ => 0,
        }
    }
}

/// Direction a point change implies for an outcome. On spreads a lower
/// number favours the side (-3 → -4.5); on totals a higher number favours
/// the over.
pub fn point_support(market_type: &str, outcome_name: &str, point_delta: f64) -> i32 {
    let sign = if point_delta > 0.0 { 1 } else { -1 };
    let outcome = outcome_name.to_lowercase();
    if market_type.contains("total") || outcome == "over" || outcome == "under" {
        if outcome == "under" {
            -sign
        } else {
            sign
        }
    } else {
        -sign
    }
}

/// Compute the movement between two snapshots of one key.
pub fn detect(
    market_type: &str,
    outcome_name: &str,
    opening: &Snapshot,
    latest: &Snapshot,
    commence_time: Option<DateTime<Utc>>,
) -> Movement {
    let price_delta = cents_delta(opening.price, latest.price);
    let point_delta = match (opening.point, latest.point) {
        (Some(a), Some(b)) => Some(b - a),
        _ => None,
    };
    Movement {
        market_key: latest.market_key.clone(),
        market_type: market_type.to_string(),
        outcome_name: outcome_name.to_string(),
        opening: opening.clone(),
        latest: latest.clone(),
        price_delta,
        point_delta,
        implied_prob_delta: implied_probability(latest.price) - implied_probability(opening.price),
        magnitude: MagnitudeBucket::from_delta(price_delta),
        timing: TimingBucket::classify(latest.captured_at, commence_time),
    }
}

/// Movement over an unordered history: opening and latest are chosen by
/// capture time. Fewer than two snapshots yields no movement.
pub fn detect_from_history(
    market_type: &str,
    outcome_name: &str,
    history: &[Snapshot],
    commence_time: Option<DateTime<Utc>>,
) -> Option<Movement> {
    if history.len() < 2 {
        return None;
    }
    let opening = history.iter().min_by_key(|s| s.captured_at)?;
    let latest = history.iter().max_by_key(|s| s.captured_at)?;
    Some(detect(market_type, outcome_name, opening, latest, commence_time))
}
