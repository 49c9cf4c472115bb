use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod api;
mod config;
mod db;
mod engine;
mod error;
mod feed;

use api::AppState;
use config::Config;
use db::Database;
use engine::signal_config::seed_defaults;
use engine::{Calibrator, LineMovementSignals, SignalEngine, SignalProvider};
use feed::{start_odds_monitor, FeedBatch, OddsProvider, TheOddsApi};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    info!("Database opened: {}", config.database_path);
    seed_defaults(&db)?;

    let provider: Arc<dyn SignalProvider> = Arc::new(LineMovementSignals);
    let params = config.calibration_params();
    let engine = SignalEngine::new(db.clone(), Arc::clone(&provider), params.buckets);
    let calibrator = Arc::new(Calibrator::new(db.clone(), Arc::clone(&provider), params));
    info!(
        "Signal provider '{}' ready ({} buckets, min {} samples)",
        provider.name(),
        params.buckets,
        params.min_bucket_samples
    );
    if config.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set; config writes and manual calibration are disabled");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Periodic calibration, one task per sport per pass
    if config.calibration_interval_secs > 0 {
        let calibrator = Arc::clone(&calibrator);
        let db = db.clone();
        let mut shutdown = shutdown_tx.subscribe();
        let every = Duration::from_secs(config.calibration_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup stays quiet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.recv() => return,
                }
                let sports = match db.list_calibration_sports() {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Failed to list calibration sports: {}", e);
                        continue;
                    }
                };
                let runs = sports.iter().map(|sport| {
                    let calibrator = Arc::clone(&calibrator);
                    async move { (sport.clone(), calibrator.run(sport).await) }
                });
                for (sport, result) in futures_util::future::join_all(runs).await {
                    if let Err(e) = result {
                        warn!("Calibration for {} did not complete: {}", sport, e);
                    }
                }
            }
        });
    }

    // Odds feed
    if let Some(api_key) = config.odds_api_key.as_deref() {
        let odds: Arc<dyn OddsProvider> = Arc::new(TheOddsApi::new(
            api_key,
            &config.odds_api_url,
            &config.odds_regions,
            &config.odds_markets,
        )?);
        let mut rx = start_odds_monitor(
            vec![odds],
            config.odds_sports.clone(),
            Duration::from_secs(config.odds_poll_interval_secs),
            shutdown_tx.subscribe(),
        );
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                match batch {
                    FeedBatch::Odds {
                        provider,
                        sport,
                        snapshots,
                    } => {
                        let total = snapshots.len();
                        let mut scored = 0usize;
                        for snap in snapshots {
                            match engine.ingest(snap).await {
                                Ok(res) => scored += res.recommendation.is_some() as usize,
                                Err(e) => warn!("Rejected {} snapshot: {}", provider, e),
                            }
                        }
                        info!(
                            "{} {}: {} snapshot(s), {} rescored",
                            provider, sport, total, scored
                        );
                    }
                    FeedBatch::Results { provider, scores, .. } => {
                        for score in &scores {
                            if let Err(e) = engine.settle(score) {
                                error!("Failed to settle {} from {}: {}", score.event_id, provider, e);
                            }
                        }
                    }
                }
            }
        });
    } else {
        info!("ODDS_API_KEY not set; odds feed disabled (snapshots via POST /api/snapshot only)");
    }

    // HTTP API
    let app = api::router(AppState {
        engine,
        calibrator: Arc::clone(&calibrator),
        admin_token: config.admin_token.clone(),
    });
    let addr: SocketAddr = config.api_addr.parse()?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let abort = calibrator.abort_handle();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            abort.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(());
        })
        .await?;

    Ok(())
}
