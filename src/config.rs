use clap::Parser;

use crate::engine::CalibrationParams;

/// Odds-movement signal engine
#[derive(Parser, Debug, Clone)]
#[command(name = "linesignal", version, about)]
pub struct Config {
    /// HTTP API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "linesignal.db")]
    pub database_path: String,

    /// Bearer token for config writes and manual calibration runs.
    /// Admin endpoints are closed when unset.
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Seconds between scheduled calibration passes (0 disables the scheduler)
    #[arg(long, env = "CALIBRATION_INTERVAL_SECS", default_value = "3600")]
    pub calibration_interval_secs: u64,

    /// Minimum verified samples before a bucket can drive an update
    #[arg(long, env = "MIN_BUCKET_SAMPLES", default_value = "5")]
    pub min_bucket_samples: i64,

    /// Number of fixed-width confidence buckets
    #[arg(long, env = "CALIBRATION_BUCKETS", default_value = "10")]
    pub calibration_buckets: usize,

    /// Damping applied to every calibration adjustment (0.0–1.0)
    #[arg(long, env = "CALIBRATION_LEARNING_RATE", default_value = "0.25")]
    pub calibration_learning_rate: f64,

    /// Accuracy PICK recommendations should reach before thresholds relax
    #[arg(long, env = "PICK_TARGET_ACCURACY", default_value = "0.55")]
    pub pick_target_accuracy: f64,

    /// Accuracy FADE recommendations should reach before thresholds relax
    #[arg(long, env = "FADE_TARGET_ACCURACY", default_value = "0.55")]
    pub fade_target_accuracy: f64,

    /// The Odds API base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com")]
    pub odds_api_url: String,

    /// The Odds API key; the feed is disabled without one
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    /// Comma-separated feed sport keys
    #[arg(
        long,
        env = "ODDS_SPORTS",
        value_delimiter = ',',
        default_value = "americanfootball_nfl,basketball_nba,baseball_mlb,icehockey_nhl"
    )]
    pub odds_sports: Vec<String>,

    /// Bookmaker regions to request
    #[arg(long, env = "ODDS_REGIONS", default_value = "us")]
    pub odds_regions: String,

    /// Markets to request
    #[arg(long, env = "ODDS_MARKETS", default_value = "h2h,spreads,totals")]
    pub odds_markets: String,

    /// Odds polling interval in seconds
    #[arg(long, env = "ODDS_POLL_INTERVAL_SECS", default_value = "60")]
    pub odds_poll_interval_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_bucket_samples < 1 {
            anyhow::bail!("min_bucket_samples must be at least 1");
        }
        if !(2..=100).contains(&self.calibration_buckets) {
            anyhow::bail!("calibration_buckets must be between 2 and 100");
        }
        if !(0.0..=1.0).contains(&self.calibration_learning_rate) {
            anyhow::bail!("calibration_learning_rate must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.pick_target_accuracy) {
            anyhow::bail!("pick_target_accuracy must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.fade_target_accuracy) {
            anyhow::bail!("fade_target_accuracy must be between 0.0 and 1.0");
        }
        if self.odds_api_key.is_some() && self.odds_poll_interval_secs < 5 {
            anyhow::bail!("odds_poll_interval_secs must be at least 5");
        }
        if self.admin_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            anyhow::bail!("ADMIN_TOKEN must not be blank");
        }
        Ok(())
    }

    pub fn calibration_params(&self) -> CalibrationParams {
        CalibrationParams {
            buckets: self.calibration_buckets,
            min_bucket_samples: self.min_bucket_samples,
            learning_rate: self.calibration_learning_rate,
            pick_target_accuracy: self.pick_target_accuracy,
            fade_target_accuracy: self.fade_target_accuracy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::parse_from(["linesignal"]);
        cfg.validate().unwrap();
        assert_eq!(cfg.odds_sports.len(), 4);
        assert_eq!(cfg.calibration_params().buckets, 10);
    }

    #[test]
    fn rejects_out_of_range_learning_rate() {
        let cfg = Config::parse_from(["linesignal", "--calibration-learning-rate", "1.5"]);
        assert!(cfg.validate().is_err());
    }
}
