use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::provider::OddsProvider;
use crate::db::models::{FinalScore, MarketKey};
use crate::engine::SnapshotInput;

/// Odds and scores from The Odds API v4.
/// Docs: <https://the-odds-api.com/liveapi/guides/v4/>
pub struct TheOddsApi {
    http: Client,
    api_key: String,
    base_url: String,
    regions: String,
    markets: String,
}

impl TheOddsApi {
    pub fn new(api_key: &str, base_url: &str, regions: &str, markets: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(TheOddsApi {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            regions: regions.to_string(),
            markets: markets.to_string(),
        })
    }

    fn endpoint(&self, sport: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let base = format!("{}/v4/sports/{}/{}", self.base_url, sport, path);
        let mut all = vec![("apiKey", self.api_key.as_str())];
        all.extend_from_slice(params);
        Url::parse_with_params(&base, &all).with_context(|| format!("Invalid odds URL {}", base))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        // Never log the key.
        debug!("Fetching {}{}", url.origin().ascii_serialization(), url.path());
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Odds API request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Odds API error: {}", resp.status());
        }
        resp.json::<T>()
            .await
            .context("Failed to parse Odds API response")
    }
}

#[async_trait]
impl OddsProvider for TheOddsApi {
    fn name(&self) -> &str {
        "TheOddsAPI"
    }

    async fn fetch_odds(&self, sport: &str) -> Result<Vec<SnapshotInput>> {
        let url = self.endpoint(
            sport,
            "odds",
            &[
                ("regions", self.regions.as_str()),
                ("markets", self.markets.as_str()),
                ("oddsFormat", "american"),
                ("dateFormat", "iso"),
            ],
        )?;
        let events: Vec<OddsEvent> = self.get_json(url).await?;
        Ok(flatten_odds(&events, Utc::now()))
    }

    async fn fetch_results(&self, sport: &str) -> Result<Vec<FinalScore>> {
        let url = self.endpoint(sport, "scores", &[("daysFrom", "1"), ("dateFormat", "iso")])?;
        let events: Vec<ScoreEvent> = self.get_json(url).await?;
        Ok(events.iter().filter_map(final_score).collect())
    }
}

#[derive(Debug, Deserialize)]
struct OddsEvent {
    id: String,
    sport_key: String,
    commence_time: Option<DateTime<Utc>>,
    home_team: Option<String>,
    away_team: Option<String>,
    #[serde(default)]
    bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize)]
struct Bookmaker {
    key: String,
    last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    markets: Vec<Market>,
}

#[derive(Debug, Deserialize)]
struct Market {
    key: String,
    last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize)]
struct Outcome {
    name: String,
    /// American odds; the API sends integers but decimals are tolerated
    price: f64,
    point: Option<f64>,
    /// Player name on prop markets
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScoreEvent {
    id: String,
    #[serde(default)]
    completed: bool,
    home_team: String,
    away_team: String,
    scores: Option<Vec<TeamScore>>,
}

#[derive(Debug, Deserialize)]
struct TeamScore {
    name: String,
    score: String,
}

/// One snapshot per event × bookmaker × market × outcome. The capture time
/// is the market's own update stamp so repeated polls of an unchanged line
/// deduplicate in the store.
fn flatten_odds(events: &[OddsEvent], fetched_at: DateTime<Utc>) -> Vec<SnapshotInput> {
    let mut out = Vec::new();
    for ev in events {
        for book in &ev.bookmakers {
            for market in &book.markets {
                let captured_at = market.last_update.or(book.last_update).unwrap_or(fetched_at);
                for outcome in &market.outcomes {
                    if !outcome.price.is_finite() {
                        continue;
                    }
                    out.push(SnapshotInput {
                        market_key: MarketKey {
                            event_id: ev.id.clone(),
                            sport: ev.sport_key.clone(),
                            bookmaker: book.key.clone(),
                            market_type: market.key.clone(),
                            outcome_name: outcome.name.clone(),
                            player_name: outcome.description.clone(),
                        },
                        price: outcome.price.round() as i32,
                        point: outcome.point,
                        captured_at,
                        commence_time: ev.commence_time,
                        public_ticket_pct: None,
                        home_team: ev.home_team.clone(),
                        away_team: ev.away_team.clone(),
                    });
                }
            }
        }
    }
    out
}

fn final_score(ev: &ScoreEvent) -> Option<FinalScore> {
    if !ev.completed {
        return None;
    }
    let scores = ev.scores.as_ref()?;
    let find = |team: &str| -> Option<i32> {
        scores
            .iter()
            .find(|s| s.name == team)
            .and_then(|s| s.score.trim().parse().ok())
    };
    Some(FinalScore {
        event_id: ev.id.clone(),
        home_team: ev.home_team.clone(),
        away_team: ev.away_team.clone(),
        home_score: find(&ev.home_team)?,
        away_score: find(&ev.away_team)?,
    })
}
