//! Attaches realised results to recommendations.
//!
//! Settlement is a one-way transition. The store applies it with a
//! compare-and-set on `verified_at`, so two concurrent verifications of the
//! same recommendation produce exactly one write and one calibration
//! increment. A line is rescored on every snapshot, so settling an event
//! grades only the closing pass of each market key and retires the rest.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::calibration::{bucket_index, bucket_range, confidence_level};
use super::movement::TimingBucket;
use crate::db::models::{
    ActualResult, BucketIncrement, Classification, FinalScore, ScoredRecommendation,
    VerifiedOutcome,
};
use crate::db::Database;
use crate::error::{EngineError, Result};

/// Whether the recommendation called the result. Pushes are never correct.
pub fn is_correct(classification: Classification, confidence: f64, result: ActualResult) -> bool {
    match result {
        ActualResult::Push => false,
        ActualResult::Win => match classification {
            Classification::Pick => true,
            Classification::Fade => false,
            Classification::Caution => confidence >= 0.5,
        },
        ActualResult::Loss => match classification {
            Classification::Pick => false,
            Classification::Fade => true,
            Classification::Caution => confidence < 0.5,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    /// `false` when the recommendation was already settled
    pub applied: bool,
    pub recommendation: ScoredRecommendation,
}

/// Record the actual result of a recommendation exactly once.
///
/// A repeated call is a no-op: it logs the double settlement and returns
/// the stored (first) outcome with `applied = false`.
pub fn verify(
    db: &Database,
    recommendation_id: i64,
    result: ActualResult,
    buckets: usize,
) -> Result<VerifyOutcome> {
    let rec = db
        .get_recommendation(recommendation_id)?
        .ok_or_else(|| EngineError::NotFound(format!("recommendation {}", recommendation_id)))?;

    if rec.verified_at.is_some() {
        warn!("{}", EngineError::DoubleSettlement(recommendation_id));
        return Ok(VerifyOutcome {
            applied: false,
            recommendation: rec,
        });
    }
    if rec.superseded {
        warn!(
            "Recommendation {} was superseded by a later pass on {}; not verifying",
            recommendation_id, rec.market_key
        );
        return Ok(VerifyOutcome {
            applied: false,
            recommendation: rec,
        });
    }

    let outcome = VerifiedOutcome {
        recommendation_id,
        actual_result: result,
        correct: is_correct(rec.classification, rec.confidence, result),
        verified_at: Utc::now(),
    };
    let increment = match result {
        ActualResult::Push => None,
        _ => {
            let (lo, hi) = bucket_range(bucket_index(rec.confidence, buckets), buckets);
            Some(BucketIncrement {
                sport: rec.sport.clone(),
                bucket_lo: lo,
                bucket_hi: hi,
                confidence_level: confidence_level(lo, hi).to_string(),
                hit: result == ActualResult::Win,
                confidence: rec.confidence,
            })
        }
    };

    let applied = db.apply_verification(&outcome, increment.as_ref())?;
    if !applied {
        warn!("{}", EngineError::DoubleSettlement(recommendation_id));
    } else {
        debug!(
            "Verified recommendation {}: {} ({} correct={})",
            recommendation_id,
            result.as_str(),
            rec.classification,
            outcome.correct
        );
    }

    let stored = db
        .get_recommendation(recommendation_id)?
        .ok_or_else(|| EngineError::NotFound(format!("recommendation {}", recommendation_id)))?;
    Ok(VerifyOutcome {
        applied,
        recommendation: stored,
    })
}

/// Grade one outcome against a final score. `None` for markets that cannot
/// be graded from a game score (player props) or when the line is missing.
pub fn grade(
    market_type: &str,
    outcome_name: &str,
    point: Option<f64>,
    score: &FinalScore,
) -> Option<ActualResult> {
    let outcome = outcome_name.trim().to_lowercase();
    let home = score.home_team.trim().to_lowercase();
    let away = score.away_team.trim().to_lowercase();
    let (own, other) = if outcome == home {
        (score.home_score, score.away_score)
    } else if outcome == away {
        (score.away_score, score.home_score)
    } else {
        (0, 0)
    };
    let side_known = outcome == home || outcome == away;

    let from_diff = |diff: f64| {
        if diff.abs() < 1e-9 {
            ActualResult::Push
        } else if diff > 0.0 {
            ActualResult::Win
        } else {
            ActualResult::Loss
        }
    };

    match market_type {
        "h2h" => {
            if outcome == "draw" {
                return Some(if score.home_score == score.away_score {
                    ActualResult::Win
                } else {
                    ActualResult::Loss
                });
            }
            side_known.then(|| from_diff((own - other) as f64))
        }
        "spreads" => {
            let p = point?;
            side_known.then(|| from_diff(own as f64 + p - other as f64))
        }
        "totals" => {
            let p = point?;
            let total = (score.home_score + score.away_score) as f64;
            match outcome.as_str() {
                "over" => Some(from_diff(total - p)),
                "under" => Some(from_diff(p - total)),
                _ => None,
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettleSummary {
    pub verified: usize,
    pub skipped: usize,
    /// Earlier passes retired in favour of each key's closing call
    pub superseded: usize,
}

/// The pass a market key is graded on: the latest one scored before the
/// event went live.
fn closing_call(passes: &[ScoredRecommendation]) -> Option<&ScoredRecommendation> {
    passes
        .iter()
        .rev()
        .find(|r| !r.superseded && r.timing != TimingBucket::Live.as_str())
}

/// Grade and verify the closing call of every market key of a finished
/// event. Safe to call repeatedly.
pub fn settle_event(db: &Database, score: &FinalScore, buckets: usize) -> Result<SettleSummary> {
    let mut by_key: BTreeMap<String, Vec<ScoredRecommendation>> = BTreeMap::new();
    for rec in db.list_recommendations_for_event(&score.event_id)? {
        by_key.entry(rec.market_key.clone()).or_default().push(rec);
    }

    let mut summary = SettleSummary::default();
    for (key_id, passes) in by_key {
        let already_settled = passes.iter().any(|r| r.verified_at.is_some());
        let closing = if already_settled {
            None
        } else {
            closing_call(&passes)
        };
        let stale: Vec<i64> = passes
            .iter()
            .filter(|r| r.verified_at.is_none() && !r.superseded)
            .filter_map(|r| r.id)
            .filter(|id| closing.and_then(|c| c.id) != Some(*id))
            .collect();
        summary.superseded += db.mark_superseded(&stale)?;

        let Some(rec) = closing else {
            continue;
        };
        let Some(id) = rec.id else {
            continue;
        };
        let Some(key) = db.get_market_key(&key_id)? else {
            summary.skipped += 1;
            continue;
        };
        // Grade against the line the recommendation was scored on.
        let point = db
            .snapshot_at_or_before(&key_id, rec.scored_at)?
            .and_then(|s| s.point);
        match grade(&key.market_type, &key.outcome_name, point, score) {
            Some(result) => {
                if verify(db, id, result, buckets)?.applied {
                    summary.verified += 1;
                } else {
                    summary.skipped += 1;
                }
            }
            None => {
                debug!("Cannot grade {} from final score", key_id);
                summary.skipped += 1;
            }
        }
    }
    info!(
        "Settled event {} ({}-{}): {} verified, {} skipped, {} superseded",
        score.event_id,
        score.home_score,
        score.away_score,
        summary.verified,
        summary.skipped,
        summary.superseded
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::MarketKey;
    use crate::engine::signal_config::resolve_config;

    fn final_score(home: i32, away: i32) -> FinalScore {
        FinalScore {
            event_id: "ev1".into(),
            home_team: "Boston Celtics".into(),
            away_team: "Miami Heat".into(),
            home_score: home,
            away_score: away,
        }
    }

    fn stored_rec(db: &Database, classification: Classification, confidence: f64) -> i64 {
        stored_pass(db, classification, confidence, "late")
    }

    fn stored_pass(
        db: &Database,
        classification: Classification,
        confidence: f64,
        timing: &str,
    ) -> i64 {
        let key = MarketKey {
            event_id: "ev1".into(),
            sport: "nba".into(),
            bookmaker: "fanduel".into(),
            market_type: "h2h".into(),
            outcome_name: "Miami Heat".into(),
            player_name: None,
        };
        db.ensure_market_key(&key).unwrap();
        let cfg = resolve_config(db, "nba").unwrap();
        let rec = ScoredRecommendation {
            id: None,
            market_key: key.id(),
            event_id: "ev1".into(),
            sport: "nba".into(),
            sharp_score: 3.0,
            trap_score: 0.5,
            signals_detected: vec!["steam_move".into()],
            classification,
            confidence,
            books_reporting: 4,
            price_delta: -20,
            point_delta: None,
            magnitude: "moderate".into(),
            timing: timing.into(),
            signal_config_version: cfg.id,
            scored_at: Utc::now(),
            actual_result: None,
            correct: None,
            verified_at: None,
            superseded: false,
        };
        db.insert_recommendation(&rec).unwrap()
    }

    #[test]
    fn correctness_rules() {
        assert!(is_correct(Classification::Pick, 0.9, ActualResult::Win));
        assert!(!is_correct(Classification::Pick, 0.9, ActualResult::Loss));
        assert!(is_correct(Classification::Fade, 0.2, ActualResult::Loss));
        assert!(is_correct(Classification::Caution, 0.4, ActualResult::Loss));
        assert!(!is_correct(Classification::Caution, 0.4, ActualResult::Win));
        assert!(!is_correct(Classification::Pick, 0.9, ActualResult::Push));
    }

    #[test]
    fn second_verification_is_a_no_op() {
        let db = Database::open(":memory:").unwrap();
        let id = stored_rec(&db, Classification::Pick, 0.72);

        let first = verify(&db, id, ActualResult::Win, 10).unwrap();
        assert!(first.applied);
        assert_eq!(first.recommendation.actual_result, Some(ActualResult::Win));
        assert_eq!(first.recommendation.correct, Some(true));

        let second = verify(&db, id, ActualResult::Loss, 10).unwrap();
        assert!(!second.applied);
        assert_eq!(second.recommendation.actual_result, Some(ActualResult::Win));
        assert_eq!(second.recommendation.correct, Some(true));
        assert_eq!(second.recommendation.verified_at, first.recommendation.verified_at);

        let buckets = db.list_calibration_buckets("nba").unwrap();
        let total: i64 = buckets.iter().map(|b| b.sample_size).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn push_is_recorded_but_not_bucketed() {
        let db = Database::open(":memory:").unwrap();
        let id = stored_rec(&db, Classification::Caution, 0.55);
        let out = verify(&db, id, ActualResult::Push, 10).unwrap();
        assert!(out.applied);
        assert_eq!(out.recommendation.correct, Some(false));
        assert!(db.list_calibration_buckets("nba").unwrap().is_empty());
    }

    #[test]
    fn unknown_recommendation_is_not_found() {
        let db = Database::open(":memory:").unwrap();
        assert!(matches!(
            verify(&db, 42, ActualResult::Win, 10),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn grades_moneyline_spread_and_total() {
        let score = final_score(104, 101);
        assert_eq!(grade("h2h", "Boston Celtics", None, &score), Some(ActualResult::Win));
        assert_eq!(grade("h2h", "Miami Heat", None, &score), Some(ActualResult::Loss));
        assert_eq!(grade("spreads", "Miami Heat", Some(3.5), &score), Some(ActualResult::Win));
        assert_eq!(grade("spreads", "Boston Celtics", Some(-3.0), &score), Some(ActualResult::Push));
        assert_eq!(grade("totals", "Over", Some(204.5), &score), Some(ActualResult::Win));
        assert_eq!(grade("totals", "Under", Some(205.0), &score), Some(ActualResult::Push));
        assert_eq!(grade("spreads", "Miami Heat", None, &score), None);
        assert_eq!(grade("player_points", "Over", Some(20.5), &score), None);
        assert_eq!(grade("h2h", "Draw", None, &final_score(1, 1)), Some(ActualResult::Win));
    }

    #[test]
    fn settle_event_grades_open_recommendations() {
        let db = Database::open(":memory:").unwrap();
        let id = stored_rec(&db, Classification::Pick, 0.7);

        let summary = settle_event(&db, &final_score(99, 110), 10).unwrap();
        assert_eq!(
            summary,
            SettleSummary {
                verified: 1,
                skipped: 0,
                superseded: 0
            }
        );
        let rec = db.get_recommendation(id).unwrap().unwrap();
        assert_eq!(rec.correct, Some(true));

        let again = settle_event(&db, &final_score(99, 110), 10).unwrap();
        assert_eq!(again.verified, 0);
    }

    #[test]
    fn one_game_counts_once_per_line() {
        let db = Database::open(":memory:").unwrap();
        let ids: Vec<i64> = (0..20)
            .map(|i| stored_rec(&db, Classification::Pick, 0.6 + i as f64 * 0.01))
            .collect();

        let summary = settle_event(&db, &final_score(99, 110), 10).unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.superseded, 19);

        let closing = db.get_recommendation(ids[19]).unwrap().unwrap();
        assert_eq!(closing.correct, Some(true));
        for id in &ids[..19] {
            let rec = db.get_recommendation(*id).unwrap().unwrap();
            assert!(rec.superseded);
            assert!(rec.verified_at.is_none());
        }
        let total: i64 = db
            .list_calibration_buckets("nba")
            .unwrap()
            .iter()
            .map(|b| b.sample_size)
            .sum();
        assert_eq!(total, 1);
        assert_eq!(db.list_verified_samples("nba").unwrap().len(), 1);

        let late = verify(&db, ids[0], ActualResult::Win, 10).unwrap();
        assert!(!late.applied);
        assert!(late.recommendation.verified_at.is_none());

        let again = settle_event(&db, &final_score(99, 110), 10).unwrap();
        assert_eq!(again, SettleSummary::default());
    }

    #[test]
    fn in_play_passes_are_not_the_closing_call() {
        let db = Database::open(":memory:").unwrap();
        let pregame = stored_pass(&db, Classification::Pick, 0.7, "closing");
        let live = stored_pass(&db, Classification::Fade, 0.3, "live");

        let summary = settle_event(&db, &final_score(99, 110), 10).unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.superseded, 1);
        assert!(db.get_recommendation(pregame).unwrap().unwrap().verified_at.is_some());
        assert!(db.get_recommendation(live).unwrap().unwrap().superseded);
    }

    #[test]
    fn manual_verification_settles_the_line() {
        let db = Database::open(":memory:").unwrap();
        let first = stored_rec(&db, Classification::Pick, 0.7);
        let second = stored_rec(&db, Classification::Pick, 0.75);
        assert!(verify(&db, first, ActualResult::Win, 10).unwrap().applied);

        let summary = settle_event(&db, &final_score(99, 110), 10).unwrap();
        assert_eq!(summary.verified, 0);
        assert_eq!(summary.superseded, 1);
        assert!(db.get_recommendation(second).unwrap().unwrap().superseded);
    }
}
