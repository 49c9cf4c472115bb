use thiserror::Error;

/// Errors surfaced by the signal engine.
///
/// Most of these are expected, non-fatal conditions: the hot ingestion and
/// scoring path turns `MissingData` and `ConfigNotFound` into skips or
/// fallbacks rather than failures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Recommendation {0} already settled")]
    DoubleSettlement(i64),

    #[error("No signal config for sport '{0}'")]
    ConfigNotFound(String),

    #[error("Insufficient sample for {sport}: {eligible} eligible bucket(s)")]
    InsufficientSample { sport: String, eligible: usize },

    #[error("Calibration already running for sport '{0}'")]
    CalibrationInProgress(String),

    #[error("Calibration aborted for sport '{sport}' after {committed} bucket(s)")]
    CalibrationAborted { sport: String, committed: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
