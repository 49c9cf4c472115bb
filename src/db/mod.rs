use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::signal_config::SignalConfig;
use crate::error::{EngineError, Result};

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Other(anyhow::anyhow!("database mutex poisoned")))
    }

    // ── Events & market keys ─────────────────────────────────────────────────

    /// Insert an event or fill in fields that were previously unknown.
    pub fn upsert_event(&self, event: &Event) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (event_id, sport, home_team, away_team, commence_time, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(event_id) DO UPDATE SET
                home_team=COALESCE(excluded.home_team, events.home_team),
                away_team=COALESCE(excluded.away_team, events.away_team),
                commence_time=COALESCE(excluded.commence_time, events.commence_time),
                updated_at=excluded.updated_at",
            params![
                event.event_id,
                event.sport,
                event.home_team,
                event.away_team,
                event.commence_time,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                "SELECT event_id, sport, home_team, away_team, commence_time
                 FROM events WHERE event_id=?1",
                params![event_id],
                |row| {
                    Ok(Event {
                        event_id: row.get(0)?,
                        sport: row.get(1)?,
                        home_team: row.get(2)?,
                        away_team: row.get(3)?,
                        commence_time: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(event)
    }

    /// Register a market key. Keys are immutable, so an existing row is left alone.
    pub fn ensure_market_key(&self, key: &MarketKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO market_keys (
                id, event_id, sport, bookmaker, market_type, outcome_name, player_name, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                key.id(),
                key.event_id,
                key.sport,
                key.bookmaker,
                key.market_type,
                key.outcome_name,
                key.player_name.as_deref().unwrap_or(""),
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_market_key(&self, id: &str) -> Result<Option<MarketKey>> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                &format!("SELECT {} FROM market_keys WHERE id=?1", MARKET_KEY_COLUMNS),
                params![id],
                map_market_key,
            )
            .optional()?;
        Ok(key)
    }

    /// Same event/market/outcome/player across every bookmaker (including `key`).
    pub fn sibling_keys(&self, key: &MarketKey) -> Result<Vec<MarketKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM market_keys
             WHERE event_id=?1 AND market_type=?2 AND outcome_name=?3 AND player_name=?4
             ORDER BY bookmaker",
            MARKET_KEY_COLUMNS
        ))?;
        let keys = stmt
            .query_map(
                params![
                    key.event_id,
                    key.market_type,
                    key.outcome_name,
                    key.player_name.as_deref().unwrap_or("")
                ],
                map_market_key,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Other outcomes of the same market at the same bookmaker.
    pub fn opposite_keys(&self, key: &MarketKey) -> Result<Vec<MarketKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM market_keys
             WHERE event_id=?1 AND bookmaker=?2 AND market_type=?3 AND player_name=?4
               AND outcome_name != ?5
             ORDER BY outcome_name",
            MARKET_KEY_COLUMNS
        ))?;
        let keys = stmt
            .query_map(
                params![
                    key.event_id,
                    key.bookmaker,
                    key.market_type,
                    key.player_name.as_deref().unwrap_or(""),
                    key.outcome_name
                ],
                map_market_key,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    // ── Snapshots ────────────────────────────────────────────────────────────

    /// Append a snapshot. Returns `false` when `(market_key, captured_at)`
    /// was already recorded; the earlier row is kept as-is.
    pub fn insert_snapshot(&self, snap: &Snapshot) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO snapshots (
                market_key, price, point, captured_at_ms, public_ticket_pct, recorded_at
             ) VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(market_key, captured_at_ms) DO NOTHING",
            params![
                snap.market_key,
                snap.price,
                snap.point,
                snap.captured_at.timestamp_millis(),
                snap.public_ticket_pct,
                Utc::now(),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Earliest snapshot by capture time.
    pub fn opening_snapshot(&self, market_key: &str) -> Result<Option<Snapshot>> {
        self.snapshot_query(
            "WHERE market_key=?1 ORDER BY captured_at_ms ASC LIMIT 1",
            params![market_key],
        )
    }

    /// Most recent snapshot by capture time.
    pub fn latest_snapshot(&self, market_key: &str) -> Result<Option<Snapshot>> {
        self.snapshot_query(
            "WHERE market_key=?1 ORDER BY captured_at_ms DESC LIMIT 1",
            params![market_key],
        )
    }

    /// Most recent snapshot captured at or before `at`.
    pub fn snapshot_at_or_before(
        &self,
        market_key: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        self.snapshot_query(
            "WHERE market_key=?1 AND captured_at_ms <= ?2 ORDER BY captured_at_ms DESC LIMIT 1",
            params![market_key, at.timestamp_millis()],
        )
    }

    pub fn snapshot_count(&self, market_key: &str) -> Result<i64> {
        let conn = self.conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE market_key=?1",
            params![market_key],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Full history for a key, ordered by capture time.
    pub fn list_snapshots(&self, market_key: &str) -> Result<Vec<Snapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM snapshots WHERE market_key=?1 ORDER BY captured_at_ms ASC",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![market_key], map_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn snapshot_query(
        &self,
        tail: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Snapshot>> {
        let conn = self.conn()?;
        let snap = conn
            .query_row(
                &format!("SELECT {} FROM snapshots {}", SNAPSHOT_COLUMNS, tail),
                params,
                map_snapshot,
            )
            .optional()?;
        Ok(snap)
    }

    // ── Signal configs ───────────────────────────────────────────────────────

    /// Write a new config version for `sport`. Existing versions are never
    /// updated, so recommendations keep pointing at what they were scored with.
    pub fn insert_signal_config(
        &self,
        sport: &str,
        source: &str,
        config: &SignalConfig,
    ) -> Result<StoredSignalConfig> {
        let params_json = serde_json::to_string(config)?;
        let created_at = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM signal_configs WHERE sport=?1",
            params![sport],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO signal_configs (sport, version, source, params, created_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![sport, version, source, params_json, created_at],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(StoredSignalConfig {
            id,
            sport: sport.to_string(),
            version,
            source: source.to_string(),
            created_at,
            config: config.clone(),
        })
    }

    /// Highest version for exactly this sport (no fallback).
    pub fn latest_signal_config(&self, sport: &str) -> Result<Option<StoredSignalConfig>> {
        let conn = self.conn()?;
        let cfg = conn
            .query_row(
                &format!(
                    "SELECT {} FROM signal_configs WHERE sport=?1 ORDER BY version DESC LIMIT 1",
                    SIGNAL_CONFIG_COLUMNS
                ),
                params![sport],
                map_signal_config,
            )
            .optional()?;
        Ok(cfg)
    }

    pub fn get_signal_config(&self, id: i64) -> Result<Option<StoredSignalConfig>> {
        let conn = self.conn()?;
        let cfg = conn
            .query_row(
                &format!("SELECT {} FROM signal_configs WHERE id=?1", SIGNAL_CONFIG_COLUMNS),
                params![id],
                map_signal_config,
            )
            .optional()?;
        Ok(cfg)
    }

    // ── Recommendations ──────────────────────────────────────────────────────

    pub fn insert_recommendation(&self, rec: &ScoredRecommendation) -> Result<i64> {
        let signals = serde_json::to_string(&rec.signals_detected)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO recommendations (
                market_key, event_id, sport, sharp_score, trap_score, signals_detected,
                classification, confidence, books_reporting, price_delta, point_delta,
                magnitude, timing, signal_config_id, scored_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                rec.market_key,
                rec.event_id,
                rec.sport,
                rec.sharp_score,
                rec.trap_score,
                signals,
                rec.classification.as_str(),
                rec.confidence,
                rec.books_reporting,
                rec.price_delta,
                rec.point_delta,
                rec.magnitude,
                rec.timing,
                rec.signal_config_version,
                rec.scored_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_recommendation(&self, id: i64) -> Result<Option<ScoredRecommendation>> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                &format!("SELECT {} FROM recommendations WHERE id=?1", RECOMMENDATION_COLUMNS),
                params![id],
                map_recommendation,
            )
            .optional()?;
        Ok(rec)
    }

    /// Most recent scoring pass for a market key.
    pub fn latest_recommendation(&self, market_key: &str) -> Result<Option<ScoredRecommendation>> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                &format!(
                    "SELECT {} FROM recommendations WHERE market_key=?1 ORDER BY id DESC LIMIT 1",
                    RECOMMENDATION_COLUMNS
                ),
                params![market_key],
                map_recommendation,
            )
            .optional()?;
        Ok(rec)
    }

    /// List recent recommendations (newest first)
    pub fn list_recommendations(&self, limit: i64) -> Result<Vec<ScoredRecommendation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM recommendations ORDER BY id DESC LIMIT ?1",
            RECOMMENDATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit], map_recommendation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every scoring pass of an event, oldest first.
    pub fn list_recommendations_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<ScoredRecommendation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM recommendations WHERE event_id=?1 ORDER BY id ASC",
            RECOMMENDATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![event_id], map_recommendation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Retire unverified passes so they can never be settled. Returns how
    /// many rows changed.
    pub fn mark_superseded(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE recommendations SET superseded=1
                 WHERE id=?1 AND verified_at IS NULL AND superseded=0",
            )?;
            for id in ids {
                changed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Apply the unsettled→settled transition for a recommendation.
    ///
    /// The update only matches rows whose `verified_at` is still NULL (and
    /// that were not superseded), so a repeated or concurrent call changes
    /// nothing and returns `false`. The
    /// bucket increment commits in the same transaction as the transition.
    pub fn apply_verification(
        &self,
        outcome: &VerifiedOutcome,
        increment: Option<&BucketIncrement>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE recommendations SET actual_result=?1, correct=?2, verified_at=?3
             WHERE id=?4 AND verified_at IS NULL AND superseded=0",
            params![
                outcome.actual_result.as_str(),
                outcome.correct,
                outcome.verified_at,
                outcome.recommendation_id,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(inc) = increment {
            let err = inc.confidence - if inc.hit { 1.0 } else { 0.0 };
            tx.execute(
                "INSERT INTO calibration_buckets (
                    sport, bucket_lo, bucket_hi, confidence_level, sample_size, hits,
                    sum_confidence, sum_squared_error, updated_at
                 ) VALUES (?1,?2,?3,?4,1,?5,?6,?7,?8)
                 ON CONFLICT(sport, bucket_lo, bucket_hi) DO UPDATE SET
                    sample_size=calibration_buckets.sample_size + 1,
                    hits=calibration_buckets.hits + excluded.hits,
                    sum_confidence=calibration_buckets.sum_confidence + excluded.sum_confidence,
                    sum_squared_error=calibration_buckets.sum_squared_error + excluded.sum_squared_error,
                    updated_at=excluded.updated_at",
                params![
                    inc.sport,
                    inc.bucket_lo,
                    inc.bucket_hi,
                    inc.confidence_level,
                    inc.hit as i64,
                    inc.confidence,
                    err * err,
                    outcome.verified_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Verified, non-push samples for a sport.
    pub fn list_verified_samples(&self, sport: &str) -> Result<Vec<VerifiedSample>> {
        let conn = self.conn()?;
        query_verified_samples(&conn, sport)
    }

    /// Sports that have at least one verified recommendation.
    pub fn list_calibration_sports(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT sport FROM recommendations
             WHERE verified_at IS NOT NULL ORDER BY sport",
        )?;
        let rows = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    // ── Calibration buckets ──────────────────────────────────────────────────

    /// Recompute one bucket from the current verified samples and write it.
    ///
    /// The read and the write share a transaction on the single connection,
    /// so a verification is either already among the samples or applies its
    /// increment on top of the rebuilt row; it is never overwritten.
    pub fn rebuild_calibration_bucket<F>(&self, sport: &str, rebuild: F) -> Result<CalibrationBucket>
    where
        F: FnOnce(&[VerifiedSample]) -> CalibrationBucket,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let samples = query_verified_samples(&tx, sport)?;
        let b = rebuild(&samples);
        tx.execute(
            "INSERT INTO calibration_buckets (
                sport, bucket_lo, bucket_hi, confidence_level, sample_size, hits,
                sum_confidence, sum_squared_error, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(sport, bucket_lo, bucket_hi) DO UPDATE SET
                confidence_level=excluded.confidence_level,
                sample_size=excluded.sample_size,
                hits=excluded.hits,
                sum_confidence=excluded.sum_confidence,
                sum_squared_error=excluded.sum_squared_error,
                updated_at=excluded.updated_at",
            params![
                b.sport,
                b.bucket_lo,
                b.bucket_hi,
                b.confidence_level,
                b.sample_size,
                b.hits,
                b.sum_confidence,
                b.sum_squared_error,
                b.updated_at,
            ],
        )?;
        tx.commit()?;
        Ok(b)
    }

    pub fn list_calibration_buckets(&self, sport: &str) -> Result<Vec<CalibrationBucket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sport, bucket_lo, bucket_hi, confidence_level, sample_size, hits,
                    sum_confidence, sum_squared_error, updated_at
             FROM calibration_buckets WHERE sport=?1 ORDER BY bucket_lo ASC",
        )?;
        let rows = stmt
            .query_map(params![sport], |row| {
                Ok(CalibrationBucket {
                    sport: row.get(0)?,
                    bucket_lo: row.get(1)?,
                    bucket_hi: row.get(2)?,
                    confidence_level: row.get(3)?,
                    sample_size: row.get(4)?,
                    hits: row.get(5)?,
                    sum_confidence: row.get(6)?,
                    sum_squared_error: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn query_verified_samples(conn: &Connection, sport: &str) -> Result<Vec<VerifiedSample>> {
    let mut stmt = conn.prepare(
        "SELECT confidence, actual_result, classification, signals_detected
         FROM recommendations
         WHERE sport=?1 AND verified_at IS NOT NULL AND actual_result != 'push'
           AND superseded=0
         ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![sport], |row| {
            let result: ActualResult = parse_text(row, 1)?;
            Ok(VerifiedSample {
                confidence: row.get(0)?,
                won: result == ActualResult::Win,
                classification: parse_text(row, 2)?,
                signals: parse_json(row, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

const MARKET_KEY_COLUMNS: &str =
    "event_id, sport, bookmaker, market_type, outcome_name, player_name";

const SNAPSHOT_COLUMNS: &str = "market_key, price, point, captured_at_ms, public_ticket_pct";

const SIGNAL_CONFIG_COLUMNS: &str = "id, sport, version, source, params, created_at";

const RECOMMENDATION_COLUMNS: &str = "id, market_key, event_id, sport, sharp_score, trap_score,
    signals_detected, classification, confidence, books_reporting, price_delta, point_delta,
    magnitude, timing, signal_config_id, scored_at, actual_result, correct, verified_at,
    superseded";

fn map_market_key(row: &Row) -> rusqlite::Result<MarketKey> {
    let player: String = row.get(5)?;
    Ok(MarketKey {
        event_id: row.get(0)?,
        sport: row.get(1)?,
        bookmaker: row.get(2)?,
        market_type: row.get(3)?,
        outcome_name: row.get(4)?,
        player_name: if player.is_empty() { None } else { Some(player) },
    })
}

fn map_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    let ms: i64 = row.get(3)?;
    let captured_at = Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Integer,
            format!("invalid timestamp {}", ms).into(),
        )
    })?;
    Ok(Snapshot {
        market_key: row.get(0)?,
        price: row.get(1)?,
        point: row.get(2)?,
        captured_at,
        public_ticket_pct: row.get(4)?,
    })
}

fn map_signal_config(row: &Row) -> rusqlite::Result<StoredSignalConfig> {
    Ok(StoredSignalConfig {
        id: row.get(0)?,
        sport: row.get(1)?,
        version: row.get(2)?,
        source: row.get(3)?,
        config: parse_json(row, 4)?,
        created_at: row.get(5)?,
    })
}

fn map_recommendation(row: &Row) -> rusqlite::Result<ScoredRecommendation> {
    let actual: Option<String> = row.get(16)?;
    let actual_result = actual
        .map(|s| {
            s.parse::<ActualResult>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(16, Type::Text, e.into())
            })
        })
        .transpose()?;
    Ok(ScoredRecommendation {
        id: row.get(0)?,
        market_key: row.get(1)?,
        event_id: row.get(2)?,
        sport: row.get(3)?,
        sharp_score: row.get(4)?,
        trap_score: row.get(5)?,
        signals_detected: parse_json(row, 6)?,
        classification: parse_text(row, 7)?,
        confidence: row.get(8)?,
        books_reporting: row.get(9)?,
        price_delta: row.get(10)?,
        point_delta: row.get(11)?,
        magnitude: row.get(12)?,
        timing: row.get(13)?,
        signal_config_version: row.get(14)?,
        scored_at: row.get(15)?,
        actual_result,
        correct: row.get(17)?,
        verified_at: row.get(18)?,
        superseded: row.get(19)?,
    })
}

fn parse_text<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id      TEXT    PRIMARY KEY,
    sport         TEXT    NOT NULL,
    home_team     TEXT,
    away_team     TEXT,
    commence_time TEXT,
    updated_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS market_keys (
    id           TEXT    PRIMARY KEY,
    event_id     TEXT    NOT NULL,
    sport        TEXT    NOT NULL,
    bookmaker    TEXT    NOT NULL,
    market_type  TEXT    NOT NULL,
    outcome_name TEXT    NOT NULL,
    player_name  TEXT    NOT NULL DEFAULT '',
    created_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    market_key        TEXT    NOT NULL,
    price             INTEGER NOT NULL,
    point             REAL,
    captured_at_ms    INTEGER NOT NULL,
    public_ticket_pct REAL,
    recorded_at       TEXT    NOT NULL,
    UNIQUE (market_key, captured_at_ms),
    FOREIGN KEY (market_key) REFERENCES market_keys(id)
);

CREATE TABLE IF NOT EXISTS signal_configs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    sport      TEXT    NOT NULL,
    version    INTEGER NOT NULL,
    source     TEXT    NOT NULL,
    params     TEXT    NOT NULL,
    created_at TEXT    NOT NULL,
    UNIQUE (sport, version)
);

CREATE TABLE IF NOT EXISTS recommendations (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    market_key       TEXT    NOT NULL,
    event_id         TEXT    NOT NULL,
    sport            TEXT    NOT NULL,
    sharp_score      REAL    NOT NULL,
    trap_score       REAL    NOT NULL,
    signals_detected TEXT    NOT NULL,
    classification   TEXT    NOT NULL,
    confidence       REAL    NOT NULL,
    books_reporting  INTEGER NOT NULL,
    price_delta      INTEGER NOT NULL,
    point_delta      REAL,
    magnitude        TEXT    NOT NULL,
    timing           TEXT    NOT NULL,
    signal_config_id INTEGER NOT NULL,
    scored_at        TEXT    NOT NULL,
    actual_result    TEXT,
    correct          INTEGER,
    verified_at      TEXT,
    superseded       INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (market_key) REFERENCES market_keys(id),
    FOREIGN KEY (signal_config_id) REFERENCES signal_configs(id)
);

CREATE TABLE IF NOT EXISTS calibration_buckets (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    sport             TEXT    NOT NULL,
    bucket_lo         REAL    NOT NULL,
    bucket_hi         REAL    NOT NULL,
    confidence_level  TEXT    NOT NULL,
    sample_size       INTEGER NOT NULL DEFAULT 0,
    hits              INTEGER NOT NULL DEFAULT 0,
    sum_confidence    REAL    NOT NULL DEFAULT 0,
    sum_squared_error REAL    NOT NULL DEFAULT 0,
    updated_at        TEXT    NOT NULL,
    UNIQUE (sport, bucket_lo, bucket_hi)
);

CREATE INDEX IF NOT EXISTS idx_market_keys_event ON market_keys(event_id, market_type);
CREATE INDEX IF NOT EXISTS idx_snapshots_key_time ON snapshots(market_key, captured_at_ms);
CREATE INDEX IF NOT EXISTS idx_recommendations_key ON recommendations(market_key, scored_at);
CREATE INDEX IF NOT EXISTS idx_recommendations_event ON recommendations(event_id);
CREATE INDEX IF NOT EXISTS idx_recommendations_sport ON recommendations(sport, verified_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> MarketKey {
        MarketKey {
            event_id: "evt1".into(),
            sport: "nfl".into(),
            bookmaker: "pinnacle".into(),
            market_type: "spreads".into(),
            outcome_name: "Chiefs".into(),
            player_name: None,
        }
    }

    fn snap(key_id: &str, price: i32, at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            market_key: key_id.to_string(),
            price,
            point: Some(-3.0),
            captured_at: at,
            public_ticket_pct: None,
        }
    }

    #[test]
    fn opening_and_latest_follow_capture_time_not_insertion_order() {
        let db = Database::open(":memory:").unwrap();
        let k = key();
        db.ensure_market_key(&k).unwrap();
        let t0 = Utc::now();
        // Newest arrives first, oldest last.
        db.insert_snapshot(&snap(&k.id(), -120, t0 + Duration::minutes(30))).unwrap();
        db.insert_snapshot(&snap(&k.id(), -115, t0 + Duration::minutes(10))).unwrap();
        db.insert_snapshot(&snap(&k.id(), -110, t0)).unwrap();

        assert_eq!(db.opening_snapshot(&k.id()).unwrap().unwrap().price, -110);
        assert_eq!(db.latest_snapshot(&k.id()).unwrap().unwrap().price, -120);
        let at = db
            .snapshot_at_or_before(&k.id(), t0 + Duration::minutes(20))
            .unwrap()
            .unwrap();
        assert_eq!(at.price, -115);
    }

    #[test]
    fn duplicate_snapshot_is_ignored() {
        let db = Database::open(":memory:").unwrap();
        let k = key();
        db.ensure_market_key(&k).unwrap();
        let t0 = Utc::now();
        assert!(db.insert_snapshot(&snap(&k.id(), -110, t0)).unwrap());
        assert!(!db.insert_snapshot(&snap(&k.id(), -125, t0)).unwrap());
        assert_eq!(db.snapshot_count(&k.id()).unwrap(), 1);
        assert_eq!(db.latest_snapshot(&k.id()).unwrap().unwrap().price, -110);
    }

    #[test]
    fn config_versions_increment_per_sport() {
        let db = Database::open(":memory:").unwrap();
        let cfg = SignalConfig::default();
        let a = db.insert_signal_config("nba", "seed", &cfg).unwrap();
        let b = db.insert_signal_config("nba", "calibration", &cfg).unwrap();
        let c = db.insert_signal_config("nhl", "seed", &cfg).unwrap();
        assert_eq!((a.version, b.version, c.version), (1, 2, 1));
        let latest = db.latest_signal_config("nba").unwrap().unwrap();
        assert_eq!(latest.id, b.id);
        assert_eq!(db.get_signal_config(a.id).unwrap().unwrap().source, "seed");
    }

    #[test]
    fn sibling_and_opposite_keys() {
        let db = Database::open(":memory:").unwrap();
        let k = key();
        let mut other_book = k.clone();
        other_book.bookmaker = "draftkings".into();
        let mut other_side = k.clone();
        other_side.outcome_name = "Bills".into();
        for mk in [&k, &other_book, &other_side] {
            db.ensure_market_key(mk).unwrap();
        }
        let siblings = db.sibling_keys(&k).unwrap();
        assert_eq!(siblings.len(), 2);
        let opposite = db.opposite_keys(&k).unwrap();
        assert_eq!(opposite, vec![other_side]);
    }
}
