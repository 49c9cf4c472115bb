use anyhow::Result;
use async_trait::async_trait;

use crate::db::models::FinalScore;
use crate::engine::SnapshotInput;

/// Trait that every odds/results feed must implement.
#[async_trait]
pub trait OddsProvider: Send + Sync {
    /// Current prices for every bookmaker/market/outcome of a sport.
    async fn fetch_odds(&self, sport: &str) -> Result<Vec<SnapshotInput>>;

    /// Final scores of events completed recently.
    async fn fetch_results(&self, sport: &str) -> Result<Vec<FinalScore>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
