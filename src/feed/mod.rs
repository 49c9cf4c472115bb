pub mod odds_api;
pub mod provider;

pub use odds_api::TheOddsApi;
pub use provider::OddsProvider;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::db::models::FinalScore;
use crate::engine::SnapshotInput;

/// Results change far less often than prices.
const RESULTS_EVERY_N_TICKS: u64 = 10;

#[derive(Debug, Clone)]
pub enum FeedBatch {
    Odds {
        provider: String,
        sport: String,
        snapshots: Vec<SnapshotInput>,
    },
    Results {
        provider: String,
        sport: String,
        scores: Vec<FinalScore>,
    },
}

/// Up to a tenth of the interval, so several instances don't hit the feed
/// in lockstep.
fn jitter(poll_interval: Duration) -> Duration {
    let max_ms = (poll_interval.as_millis() / 10).max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Spawns a background task that polls every provider × sport
/// concurrently and forwards the batches through the returned channel.
pub fn start_odds_monitor(
    providers: Vec<Arc<dyn OddsProvider>>,
    sports: Vec<String>,
    poll_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> mpsc::Receiver<FeedBatch> {
    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let provider_names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        info!(
            "Odds monitor started ({} providers: {:?}, sports={:?}, interval={:?})",
            providers.len(),
            provider_names,
            sports,
            poll_interval
        );

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => {
                    info!("Odds monitor stopping");
                    return;
                }
            }
            tokio::time::sleep(jitter(poll_interval)).await;
            let with_results = tick % RESULTS_EVERY_N_TICKS == 0;
            tick += 1;

            let fetches: Vec<_> = providers
                .iter()
                .flat_map(|p| sports.iter().map(move |s| (Arc::clone(p), s.clone())))
                .map(|(p, sport)| async move {
                    let odds = p.fetch_odds(&sport).await;
                    let results = if with_results {
                        Some(p.fetch_results(&sport).await)
                    } else {
                        None
                    };
                    (p.name().to_string(), sport, odds, results)
                })
                .collect();

            for (provider, sport, odds, results) in futures_util::future::join_all(fetches).await {
                match odds {
                    Ok(snapshots) if !snapshots.is_empty() => {
                        let batch = FeedBatch::Odds {
                            provider: provider.clone(),
                            sport: sport.clone(),
                            snapshots,
                        };
                        if tx.send(batch).await.is_err() {
                            error!("Feed channel closed; odds monitor exiting");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Provider '{}' odds for {} failed: {}", provider, sport, e),
                }
                match results {
                    Some(Ok(scores)) if !scores.is_empty() => {
                        let batch = FeedBatch::Results {
                            provider: provider.clone(),
                            sport: sport.clone(),
                            scores,
                        };
                        if tx.send(batch).await.is_err() {
                            error!("Feed channel closed; odds monitor exiting");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Provider '{}' results for {} failed: {}", provider, sport, e)
                    }
                    _ => {}
                }
            }
        }
    });

    rx
}
