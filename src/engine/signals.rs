//! Weighted sharp/trap signal scoring.
//!
//! A [`SignalProvider`] is a named set of indicator functions split into
//! "sharp" (informed money) and "trap" (public bait) groups. Each indicator
//! is a pure function of the movement, its context and the active config,
//! returning a grade in `[0, 1]`, or `None` when the data it needs is
//! missing (the indicator is then skipped, not failed).
//!
//! The two scores are independent sums; a movement can score high on both.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::movement::{Movement, MagnitudeBucket, SMALL_THRESHOLD};
use super::signal_config::SignalConfig;

/// Implied-probability gain that earns full closing-line-value credit.
const CLV_FULL_SCALE: f64 = 0.05;
/// Smallest price move (cents) that counts as juice shading.
const JUICE_MIN_MOVE: i32 = 5;

/// What one other bookmaker did on the same outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookMove {
    pub bookmaker: String,
    /// Opening-to-latest price delta (cents)
    pub price_delta: i32,
    /// Price delta inside the steam window ending at the scored snapshot
    pub window_delta: i32,
    /// +1 toward the outcome, -1 away, 0 flat
    pub support: i32,
    pub last_move_at: DateTime<Utc>,
}

/// Auxiliary inputs gathered by the pipeline for one scoring pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalContext {
    /// Distinct bookmakers with at least one snapshot on this outcome
    pub books_reporting: u32,
    /// One entry per reporting bookmaker, including the scored one
    pub book_moves: Vec<BookMove>,
    /// Price deltas of the other outcomes at the same bookmaker
    pub opposite_price_deltas: Vec<i32>,
    /// Share of public tickets on this outcome, 0–100
    pub public_ticket_pct: Option<f64>,
}

impl SignalContext {
    /// Share of reporting books that moved toward the outcome.
    pub fn consensus_ratio(&self) -> f64 {
        if self.books_reporting == 0 {
            return 0.0;
        }
        let agreeing = self.book_moves.iter().filter(|b| b.support > 0).count();
        (agreeing as f64 / self.books_reporting as f64).clamp(0.0, 1.0)
    }
}

pub type IndicatorFn = fn(&Movement, &SignalContext, &SignalConfig) -> Option<f64>;

pub struct Indicator {
    pub name: &'static str,
    pub eval: IndicatorFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Sharp,
    Trap,
}

/// One evaluated indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalHit {
    pub name: String,
    pub side: SignalSide,
    pub value: f64,
    pub weight: f64,
}

impl SignalHit {
    pub fn contribution(&self) -> f64 {
        self.value * self.weight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalScores {
    pub sharp_score: f64,
    pub trap_score: f64,
    /// Indicators that evaluated (missing-data indicators are absent)
    pub hits: Vec<SignalHit>,
}

impl SignalScores {
    /// Names of indicators that fired (value > 0).
    pub fn detected(&self) -> Vec<String> {
        self.hits
            .iter()
            .filter(|h| h.value > 0.0)
            .map(|h| h.name.clone())
            .collect()
    }
}

/// A family of weighted indicators. Sibling engines (player props,
/// consensus trackers) are further implementations with their own
/// indicator sets and config scopes.
pub trait SignalProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn sharp_indicators(&self) -> &'static [Indicator];

    fn trap_indicators(&self) -> &'static [Indicator];

    fn side_of(&self, signal: &str) -> Option<SignalSide> {
        if self.sharp_indicators().iter().any(|i| i.name == signal) {
            Some(SignalSide::Sharp)
        } else if self.trap_indicators().iter().any(|i| i.name == signal) {
            Some(SignalSide::Trap)
        } else {
            None
        }
    }
}

/// Evaluate every indicator of `provider` and sum the weighted grades.
pub fn score(
    provider: &dyn SignalProvider,
    movement: &Movement,
    ctx: &SignalContext,
    cfg: &SignalConfig,
) -> SignalScores {
    let mut hits = Vec::new();
    let mut sharp_score = 0.0;
    let mut trap_score = 0.0;

    let groups = [
        (SignalSide::Sharp, provider.sharp_indicators()),
        (SignalSide::Trap, provider.trap_indicators()),
    ];
    for (side, indicators) in groups {
        for ind in indicators {
            let Some(value) = (ind.eval)(movement, ctx, cfg) else {
                continue;
            };
            let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
            let hit = SignalHit {
                name: ind.name.to_string(),
                side,
                value,
                weight: cfg.weight(ind.name),
            };
            match side {
                SignalSide::Sharp => sharp_score += hit.contribution(),
                SignalSide::Trap => trap_score += hit.contribution(),
            }
            hits.push(hit);
        }
    }

    SignalScores {
        sharp_score,
        trap_score,
        hits,
    }
}

// ── Line-movement provider ─────────────────────────────────────────────────────

/// Signals over the opening-to-current move of a single betting line.
pub struct LineMovementSignals;

static LINE_SHARP: [Indicator; 6] = [
    Indicator { name: "reverse_line_movement", eval: reverse_line_movement },
    Indicator { name: "steam_move", eval: steam_move },
    Indicator { name: "late_money", eval: late_money },
    Indicator { name: "multi_book_consensus", eval: multi_book_consensus },
    Indicator { name: "closing_line_value", eval: closing_line_value },
    Indicator { name: "magnitude", eval: magnitude },
];

static LINE_TRAP: [Indicator; 5] = [
    Indicator { name: "single_book_only", eval: single_book_only },
    Indicator { name: "price_only_move", eval: price_only_move },
    Indicator { name: "early_morning_move", eval: early_morning_move },
    Indicator { name: "both_sides_moved", eval: both_sides_moved },
    Indicator { name: "juice_only_move", eval: juice_only_move },
];

impl SignalProvider for LineMovementSignals {
    fn name(&self) -> &'static str {
        "line_movement"
    }

    fn sharp_indicators(&self) -> &'static [Indicator] {
        &LINE_SHARP
    }

    fn trap_indicators(&self) -> &'static [Indicator] {
        &LINE_TRAP
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Line moved toward this outcome while most public tickets sit on the other side.
fn reverse_line_movement(m: &Movement, ctx: &SignalContext, _: &SignalConfig) -> Option<f64> {
    let pct = ctx.public_ticket_pct?;
    Some(flag(m.support() > 0 && pct < 50.0))
}

/// Enough books moved the same way, by enough, inside the steam window.
fn steam_move(m: &Movement, ctx: &SignalContext, cfg: &SignalConfig) -> Option<f64> {
    if m.support() <= 0 {
        return Some(0.0);
    }
    let window_start = m.latest.captured_at - chrono::Duration::minutes(cfg.steam_window_minutes);
    let synced = ctx
        .book_moves
        .iter()
        .filter(|b| {
            b.last_move_at >= window_start
                && b.window_delta.signum() == m.price_delta.signum()
                && b.window_delta.abs() >= cfg.steam_min_move
        })
        .count() as u32;
    Some(flag(synced >= cfg.steam_min_books))
}

fn late_money(m: &Movement, _: &SignalContext, _: &SignalConfig) -> Option<f64> {
    Some(flag(
        m.support() > 0 && m.timing.is_late() && m.magnitude >= MagnitudeBucket::Small,
    ))
}

/// Graded by the share of books agreeing, once enough books report.
fn multi_book_consensus(m: &Movement, ctx: &SignalContext, cfg: &SignalConfig) -> Option<f64> {
    if m.support() <= 0 || ctx.books_reporting < cfg.min_consensus_books.max(2) {
        return Some(0.0);
    }
    let ratio = ctx.consensus_ratio();
    Some(if ratio >= 0.5 { ratio } else { 0.0 })
}

/// Value already captured by the opening number relative to the current one.
fn closing_line_value(m: &Movement, _: &SignalContext, _: &SignalConfig) -> Option<f64> {
    if m.support() <= 0 {
        return Some(0.0);
    }
    Some((m.implied_prob_delta / CLV_FULL_SCALE).clamp(0.0, 1.0))
}

/// Base magnitude term: bucket weight times timing weight.
fn magnitude(m: &Movement, _: &SignalContext, cfg: &SignalConfig) -> Option<f64> {
    if m.support() <= 0 {
        return Some(0.0);
    }
    Some((cfg.movement_weight(m.magnitude) * cfg.time_weight(m.timing)).clamp(0.0, 1.0))
}

/// Only one bookmaker moved toward the outcome.
fn single_book_only(m: &Movement, ctx: &SignalContext, _: &SignalConfig) -> Option<f64> {
    if m.support() <= 0 || !m.price_moved() {
        return Some(0.0);
    }
    let movers = ctx.book_moves.iter().filter(|b| b.support > 0).count();
    Some(flag(ctx.books_reporting <= 1 || movers <= 1))
}

/// Price moved but the point did not. Needs a point on both snapshots.
fn price_only_move(m: &Movement, _: &SignalContext, _: &SignalConfig) -> Option<f64> {
    let point_moved = m.point_moved()?;
    Some(flag(m.support() > 0 && m.price_moved() && !point_moved))
}

fn early_morning_move(m: &Movement, _: &SignalContext, cfg: &SignalConfig) -> Option<f64> {
    if m.support() <= 0 || !m.price_moved() {
        return Some(0.0);
    }
    let hour = m.latest.captured_at.hour();
    let (start, end) = (cfg.early_morning_start_hour, cfg.early_morning_end_hour);
    let in_window = if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    };
    Some(flag(in_window))
}

/// Both sides shortened together: the book is widening its margin, not
/// reacting to money. Needs the opposite side to be tracked.
fn both_sides_moved(m: &Movement, ctx: &SignalContext, _: &SignalConfig) -> Option<f64> {
    if ctx.opposite_price_deltas.is_empty() {
        return None;
    }
    let ours = m.price_delta <= -SMALL_THRESHOLD;
    let theirs = ctx
        .opposite_price_deltas
        .iter()
        .any(|d| *d <= -SMALL_THRESHOLD);
    Some(flag(ours && theirs))
}

/// A small juice change with the point untouched, dressed up as a move.
fn juice_only_move(m: &Movement, _: &SignalContext, _: &SignalConfig) -> Option<f64> {
    let point_moved = m.point_moved()?;
    Some(flag(
        m.support() > 0
            && !point_moved
            && m.price_delta.abs() >= JUICE_MIN_MOVE
            && m.magnitude <= MagnitudeBucket::Small,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Snapshot;
    use crate::engine::movement::detect;
    use chrono::{Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 18, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn movement(open: i32, last: i32, open_pt: Option<f64>, last_pt: Option<f64>) -> Movement {
        let s = |price, point, t| Snapshot {
            market_key: "k".into(),
            price,
            point,
            captured_at: at(t),
            public_ticket_pct: None,
        };
        detect("spreads", "Chiefs", &s(open, open_pt, -120), &s(last, last_pt, 0), None)
    }

    fn book(name: &str, delta: i32) -> BookMove {
        BookMove {
            bookmaker: name.into(),
            price_delta: delta,
            window_delta: delta,
            support: -delta.signum(),
            last_move_at: at(0),
        }
    }

    #[test]
    fn missing_point_skips_point_signals() {
        let m = movement(-110, -125, None, None);
        let ctx = SignalContext {
            books_reporting: 1,
            book_moves: vec![book("a", -15)],
            ..Default::default()
        };
        let scores = score(&LineMovementSignals, &m, &ctx, &SignalConfig::default());
        assert!(scores.hits.iter().all(|h| h.name != "price_only_move"));
        assert!(scores.hits.iter().all(|h| h.name != "juice_only_move"));
        assert!(scores.hits.iter().all(|h| h.name != "reverse_line_movement"));
        assert!(scores.detected().contains(&"single_book_only".to_string()));
    }

    #[test]
    fn movement_away_from_outcome_scores_nothing() {
        let m = movement(-130, -110, Some(-3.0), Some(-3.0));
        let ctx = SignalContext {
            books_reporting: 4,
            book_moves: vec![book("a", 20), book("b", 20), book("c", 20), book("d", 20)],
            public_ticket_pct: Some(30.0),
            ..Default::default()
        };
        let scores = score(&LineMovementSignals, &m, &ctx, &SignalConfig::default());
        assert_eq!(scores.sharp_score, 0.0);
        assert_eq!(scores.trap_score, 0.0);
    }

    #[test]
    fn steam_needs_enough_synchronized_books() {
        let m = movement(-110, -128, Some(-3.0), Some(-4.5));
        let cfg = SignalConfig::default();
        let two = SignalContext {
            books_reporting: 2,
            book_moves: vec![book("a", -18), book("b", -18)],
            ..Default::default()
        };
        assert_eq!(steam_move(&m, &two, &cfg), Some(0.0));
        let mut stale = book("c", -18);
        stale.last_move_at = at(-cfg.steam_window_minutes - 1);
        let three_one_stale = SignalContext {
            books_reporting: 3,
            book_moves: vec![book("a", -18), book("b", -18), stale],
            ..Default::default()
        };
        assert_eq!(steam_move(&m, &three_one_stale, &cfg), Some(0.0));
        let three = SignalContext {
            books_reporting: 3,
            book_moves: vec![book("a", -18), book("b", -12), book("c", -10)],
            ..Default::default()
        };
        assert_eq!(steam_move(&m, &three, &cfg), Some(1.0));
    }

    #[test]
    fn both_sides_needs_opposite_side() {
        let m = movement(-110, -125, Some(-3.0), Some(-3.0));
        let cfg = SignalConfig::default();
        assert_eq!(both_sides_moved(&m, &SignalContext::default(), &cfg), None);
        let ctx = SignalContext {
            opposite_price_deltas: vec![-12],
            ..Default::default()
        };
        assert_eq!(both_sides_moved(&m, &ctx, &cfg), Some(1.0));
    }

    #[test]
    fn early_morning_window_wraps_midnight() {
        let m = movement(-110, -125, Some(-3.0), Some(-3.0));
        let mut cfg = SignalConfig::default();
        cfg.early_morning_start_hour = 22;
        cfg.early_morning_end_hour = 2;
        // latest snapshot is at 18:00 UTC
        assert_eq!(early_morning_move(&m, &SignalContext::default(), &cfg), Some(0.0));
        cfg.early_morning_start_hour = 17;
        cfg.early_morning_end_hour = 19;
        assert_eq!(early_morning_move(&m, &SignalContext::default(), &cfg), Some(1.0));
    }

    #[test]
    fn juice_only_fires_for_small_moves() {
        let cfg = SignalConfig::default();
        let small = movement(-110, -118, Some(-3.0), Some(-3.0));
        assert_eq!(juice_only_move(&small, &SignalContext::default(), &cfg), Some(1.0));
        let big = movement(-110, -140, Some(-3.0), Some(-3.0));
        assert_eq!(juice_only_move(&big, &SignalContext::default(), &cfg), Some(0.0));
    }

    #[test]
    fn scoring_is_pure() {
        let m = movement(-110, -128, Some(-3.0), Some(-4.5));
        let ctx = SignalContext {
            books_reporting: 3,
            book_moves: vec![book("a", -18), book("b", -18), book("c", -18)],
            public_ticket_pct: Some(40.0),
            ..Default::default()
        };
        let cfg = SignalConfig::default();
        assert_eq!(
            score(&LineMovementSignals, &m, &ctx, &cfg),
            score(&LineMovementSignals, &m, &ctx, &cfg)
        );
    }

    #[test]
    fn provider_knows_signal_sides() {
        let p = LineMovementSignals;
        assert_eq!(p.side_of("steam_move"), Some(SignalSide::Sharp));
        assert_eq!(p.side_of("single_book_only"), Some(SignalSide::Trap));
        assert_eq!(p.side_of("nope"), None);
    }
}
