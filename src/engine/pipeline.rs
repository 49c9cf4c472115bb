use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::classifier::{classify, confidence};
use super::movement::{cents_delta, detect, is_valid_price, Movement, MAX_PRICE_MAGNITUDE};
use super::signal_config::resolve_config;
use super::signals::{self, BookMove, SignalContext, SignalProvider};
use super::verifier::{self, SettleSummary, VerifyOutcome};
use crate::db::models::{ActualResult, Event, FinalScore, MarketKey, ScoredRecommendation, Snapshot};
use crate::db::Database;
use crate::error::{EngineError, Result};

/// One observation as it arrives from the API or the odds feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInput {
    pub market_key: MarketKey,
    pub price: i32,
    #[serde(default)]
    pub point: Option<f64>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub commence_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub public_ticket_pct: Option<f64>,
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub inserted: bool,
    pub recommendation: Option<ScoredRecommendation>,
}

/// Snapshot → movement → scores → classification, per market key.
#[derive(Clone)]
pub struct SignalEngine {
    db: Database,
    provider: Arc<dyn SignalProvider>,
    key_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    buckets: usize,
}

impl SignalEngine {
    pub fn new(db: Database, provider: Arc<dyn SignalProvider>, buckets: usize) -> Self {
        SignalEngine {
            db,
            provider,
            key_locks: Arc::new(DashMap::new()),
            buckets,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn provider(&self) -> Arc<dyn SignalProvider> {
        Arc::clone(&self.provider)
    }

    fn key_lock(&self, key_id: &str) -> Arc<Mutex<()>> {
        self.key_locks.entry(key_id.to_string()).or_default().clone()
    }

    /// Drop the registry entry once no task holds or waits on it.
    fn release_key_lock(&self, key_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.key_locks.remove_if(key_id, |_, l| Arc::strong_count(l) == 1);
    }

    /// Record a snapshot and rescore its key. The key lock is held across
    /// both steps so scoring never reads a half-recorded history.
    pub async fn ingest(&self, input: SnapshotInput) -> Result<IngestResult> {
        validate_input(&input)?;
        let key = input.market_key.normalized();
        let key_id = key.id();

        self.db.upsert_event(&Event {
            event_id: key.event_id.clone(),
            sport: key.sport.clone(),
            home_team: input.home_team.clone(),
            away_team: input.away_team.clone(),
            commence_time: input.commence_time,
        })?;
        self.db.ensure_market_key(&key)?;

        let lock = self.key_lock(&key_id);
        let result = {
            let _guard = lock.lock().await;
            self.record_and_score(&key, &input)
        };
        self.release_key_lock(&key_id, lock);
        result
    }

    fn record_and_score(&self, key: &MarketKey, input: &SnapshotInput) -> Result<IngestResult> {
        let key_id = key.id();
        let inserted = self.db.insert_snapshot(&Snapshot {
            market_key: key_id.clone(),
            price: input.price,
            point: input.point,
            captured_at: input.captured_at,
            public_ticket_pct: input.public_ticket_pct,
        })?;
        if !inserted {
            debug!("Duplicate snapshot for {} at {}", key_id, input.captured_at);
            return Ok(IngestResult {
                inserted: false,
                recommendation: None,
            });
        }

        let recommendation = match self.score_locked(key) {
            Ok(rec) => Some(rec),
            Err(EngineError::MissingData(reason)) => {
                debug!("Skipped scoring {}: {}", key_id, reason);
                None
            }
            Err(e) => return Err(e),
        };
        Ok(IngestResult {
            inserted: true,
            recommendation,
        })
    }

    /// Rescore a key from its stored history.
    pub async fn score(&self, key_id: &str) -> Result<ScoredRecommendation> {
        let key = self
            .db
            .get_market_key(key_id)?
            .ok_or_else(|| EngineError::NotFound(format!("market key {}", key_id)))?;
        let lock = self.key_lock(key_id);
        let result = {
            let _guard = lock.lock().await;
            self.score_locked(&key)
        };
        self.release_key_lock(key_id, lock);
        result
    }

    fn score_locked(&self, key: &MarketKey) -> Result<ScoredRecommendation> {
        let key_id = key.id();
        if self.db.snapshot_count(&key_id)? < 2 {
            return Err(EngineError::MissingData(format!(
                "{} has fewer than two snapshots",
                key_id
            )));
        }
        let (Some(opening), Some(latest)) = (
            self.db.opening_snapshot(&key_id)?,
            self.db.latest_snapshot(&key_id)?,
        ) else {
            return Err(EngineError::MissingData(format!("{} has no history", key_id)));
        };
        let commence = self
            .db
            .get_event(&key.event_id)?
            .and_then(|e| e.commence_time);
        let movement = detect(&key.market_type, &key.outcome_name, &opening, &latest, commence);

        let cfg = resolve_config(&self.db, &key.sport)?;
        let ctx = self.build_context(key, &movement, cfg.config.steam_window_minutes)?;
        let scores = signals::score(self.provider.as_ref(), &movement, &ctx, &cfg.config);
        let classification = classify(
            scores.sharp_score,
            scores.trap_score,
            ctx.books_reporting,
            &cfg.config,
        );
        let confidence = confidence(scores.sharp_score, scores.trap_score, cfg.config.logistic_k);

        let mut rec = ScoredRecommendation {
            id: None,
            market_key: key_id.clone(),
            event_id: key.event_id.clone(),
            sport: key.sport.clone(),
            sharp_score: scores.sharp_score,
            trap_score: scores.trap_score,
            signals_detected: scores.detected(),
            classification,
            confidence,
            books_reporting: ctx.books_reporting as i64,
            price_delta: movement.price_delta,
            point_delta: movement.point_delta,
            magnitude: movement.magnitude.as_str().to_string(),
            timing: movement.timing.as_str().to_string(),
            signal_config_version: cfg.id,
            scored_at: Utc::now(),
            actual_result: None,
            correct: None,
            verified_at: None,
            superseded: false,
        };
        rec.id = Some(self.db.insert_recommendation(&rec)?);

        debug!(
            "Scored {} [{}]: sharp={:.3} trap={:.3} {} conf={:.3} books={} signals={:?} (config id={})",
            key_id,
            self.provider.name(),
            rec.sharp_score,
            rec.trap_score,
            rec.classification,
            rec.confidence,
            rec.books_reporting,
            rec.signals_detected,
            cfg.id
        );
        Ok(rec)
    }

    /// Gather what every other book did on this outcome, and what happened
    /// to the other side at this book.
    fn build_context(
        &self,
        key: &MarketKey,
        movement: &Movement,
        steam_window_minutes: i64,
    ) -> Result<SignalContext> {
        let window_start = movement.latest.captured_at - Duration::minutes(steam_window_minutes);

        let mut book_moves = Vec::new();
        for sibling in self.db.sibling_keys(key)? {
            let sib_id = sibling.id();
            let (Some(open), Some(last)) = (
                self.db.opening_snapshot(&sib_id)?,
                self.db.latest_snapshot(&sib_id)?,
            ) else {
                continue;
            };
            let base = self
                .db
                .snapshot_at_or_before(&sib_id, window_start)?
                .unwrap_or_else(|| open.clone());
            let sib_move = detect(&key.market_type, &key.outcome_name, &open, &last, None);
            book_moves.push(BookMove {
                bookmaker: sibling.bookmaker.clone(),
                price_delta: sib_move.price_delta,
                window_delta: cents_delta(base.price, last.price),
                support: sib_move.support(),
                last_move_at: last.captured_at,
            });
        }

        let mut opposite_price_deltas = Vec::new();
        for other in self.db.opposite_keys(key)? {
            let other_id = other.id();
            if let (Some(open), Some(last)) = (
                self.db.opening_snapshot(&other_id)?,
                self.db.latest_snapshot(&other_id)?,
            ) {
                opposite_price_deltas.push(cents_delta(open.price, last.price));
            }
        }

        Ok(SignalContext {
            books_reporting: book_moves.len() as u32,
            book_moves,
            opposite_price_deltas,
            public_ticket_pct: movement.latest.public_ticket_pct,
        })
    }

    pub fn verify(&self, recommendation_id: i64, result: ActualResult) -> Result<VerifyOutcome> {
        verifier::verify(&self.db, recommendation_id, result, self.buckets)
    }

    pub fn settle(&self, score: &FinalScore) -> Result<SettleSummary> {
        verifier::settle_event(&self.db, score, self.buckets)
    }
}

fn validate_input(input: &SnapshotInput) -> Result<()> {
    let k = &input.market_key;
    for (field, value) in [
        ("event_id", &k.event_id),
        ("bookmaker", &k.bookmaker),
        ("market_type", &k.market_type),
        ("outcome_name", &k.outcome_name),
    ] {
        if value.trim().is_empty() {
            return Err(EngineError::InvalidInput(format!("market_key.{} is empty", field)));
        }
    }
    if k.event_id.contains('|') || k.bookmaker.contains('|') || k.outcome_name.contains('|') {
        return Err(EngineError::InvalidInput("market_key fields may not contain '|'".into()));
    }
    if !is_valid_price(input.price) {
        return Err(EngineError::InvalidInput(format!(
            "price {} is not valid American odds (magnitude 100 to {})",
            input.price, MAX_PRICE_MAGNITUDE
        )));
    }
    if let Some(p) = input.point {
        if !p.is_finite() {
            return Err(EngineError::InvalidInput("point must be finite".into()));
        }
    }
    if let Some(pct) = input.public_ticket_pct {
        if !(0.0..=100.0).contains(&pct) {
            return Err(EngineError::InvalidInput(
                "public_ticket_pct must be within 0-100".into(),
            ));
        }
    }
    Ok(())
}
