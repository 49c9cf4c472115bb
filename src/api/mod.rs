use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::db::models::{ActualResult, FinalScore};
use crate::engine::movement::detect_from_history;
use crate::engine::signal_config::{normalize_sport, resolve_config, SignalConfig, DEFAULT_SPORT};
use crate::engine::{Calibrator, SignalEngine, SnapshotInput};
use crate::error::EngineError;

#[derive(Clone)]
pub struct AppState {
    pub engine: SignalEngine,
    pub calibrator: Arc<Calibrator>,
    /// Bearer token for config writes and manual calibration runs
    pub admin_token: Option<String>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Build the Axum router for the HTTP API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/snapshot", post(snapshot_handler))
        .route("/api/snapshots", get(snapshots_handler))
        .route("/api/movement", get(movement_handler))
        .route("/api/recommendation", get(recommendation_handler))
        .route("/api/recommendations", get(recommendations_handler))
        .route("/api/verify", post(verify_handler))
        .route("/api/settle", post(settle_handler))
        .route("/api/calibration", get(calibration_handler))
        .route("/api/calibration/run", post(calibration_run_handler))
        .route(
            "/api/signal-config",
            get(signal_config_handler).put(signal_config_update_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn error_response(e: EngineError) -> (StatusCode, String) {
    let status = match &e {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::CalibrationInProgress(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")))
        .map(str::trim);
    match (state.admin_token.as_deref(), provided) {
        (Some(expected), Some(token)) if !expected.is_empty() && token == expected => Ok(()),
        _ => Err(error_response(EngineError::Unauthorized)),
    }
}

#[derive(Debug, Deserialize)]
struct MarketKeyQuery {
    market_key: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct SportQuery {
    sport: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    sport: Option<String>,
    /// Exact config row, as referenced by a recommendation
    id: Option<i64>,
}

impl SportQuery {
    fn sport(&self) -> String {
        self.sport
            .as_deref()
            .map(normalize_sport)
            .unwrap_or_else(|| DEFAULT_SPORT.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    recommendation_id: i64,
    actual_result: ActualResult,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: &'static str,
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        provider: state.engine.provider().name(),
    })
}

/// POST /api/snapshot
async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SnapshotInput>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .ingest(input)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/snapshots?market_key=...
async fn snapshots_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketKeyQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .db()
        .list_snapshots(&q.market_key)
        .map(Json)
        .map_err(error_response)
}

/// GET /api/movement?market_key=...
///
/// Recomputed from the stored history on every call.
async fn movement_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketKeyQuery>,
) -> ApiResult<impl IntoResponse> {
    let db = state.engine.db();
    let not_found = |what: &str| error_response(EngineError::NotFound(format!("{} for {}", what, q.market_key)));
    let key = db
        .get_market_key(&q.market_key)
        .map_err(error_response)?
        .ok_or_else(|| not_found("market key"))?;
    let history = db.list_snapshots(&q.market_key).map_err(error_response)?;
    let commence = db
        .get_event(&key.event_id)
        .map_err(error_response)?
        .and_then(|e| e.commence_time);
    detect_from_history(&key.market_type, &key.outcome_name, &history, commence)
        .map(Json)
        .ok_or_else(|| not_found("movement (fewer than two snapshots)"))
}

/// GET /api/recommendation?market_key=...
async fn recommendation_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketKeyQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .db()
        .latest_recommendation(&q.market_key)
        .map_err(error_response)?
        .map(Json)
        .ok_or_else(|| {
            error_response(EngineError::NotFound(format!(
                "no recommendation for {}",
                q.market_key
            )))
        })
}

/// GET /api/recommendations?limit=50
async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .db()
        .list_recommendations(q.limit.clamp(1, 500))
        .map(Json)
        .map_err(error_response)
}

/// POST /api/verify
async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .engine
        .verify(req.recommendation_id, req.actual_result)
        .map(Json)
        .map_err(error_response)
}

/// POST /api/settle
async fn settle_handler(
    State(state): State<Arc<AppState>>,
    Json(score): Json<FinalScore>,
) -> ApiResult<impl IntoResponse> {
    state.engine.settle(&score).map(Json).map_err(error_response)
}

/// GET /api/calibration?sport=nba
async fn calibration_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SportQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .calibrator
        .report(&q.sport())
        .map(Json)
        .map_err(error_response)
}

/// POST /api/calibration/run?sport=nba (admin)
async fn calibration_run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<SportQuery>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers)?;
    state
        .calibrator
        .run(&q.sport())
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /api/signal-config?sport=nba or ?id=42
async fn signal_config_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConfigQuery>,
) -> ApiResult<impl IntoResponse> {
    let db = state.engine.db();
    if let Some(id) = q.id {
        return db
            .get_signal_config(id)
            .map_err(error_response)?
            .map(Json)
            .ok_or_else(|| error_response(EngineError::NotFound(format!("signal config {}", id))));
    }
    let sport = q
        .sport
        .as_deref()
        .map(normalize_sport)
        .unwrap_or_else(|| DEFAULT_SPORT.to_string());
    resolve_config(db, &sport).map(Json).map_err(error_response)
}

/// PUT /api/signal-config?sport=nba (admin). Omitted fields take defaults.
async fn signal_config_update_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<SportQuery>,
    Json(cfg): Json<SignalConfig>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers)?;
    cfg.validate().map_err(error_response)?;
    let sport = q.sport();
    let stored = state
        .engine
        .db()
        .insert_signal_config(&sport, "operator", &cfg)
        .map_err(error_response)?;
    info!(
        "Operator wrote {} signal config v{} (id={})",
        sport, stored.version, stored.id
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::signal_config::seed_defaults;
    use crate::engine::{CalibrationParams, LineMovementSignals, SignalProvider};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(admin_token: Option<&str>) -> Router {
        let db = Database::open(":memory:").unwrap();
        seed_defaults(&db).unwrap();
        let provider: Arc<dyn SignalProvider> = Arc::new(LineMovementSignals);
        let engine = SignalEngine::new(db.clone(), provider.clone(), 10);
        let calibrator = Arc::new(Calibrator::new(db, provider, CalibrationParams::default()));
        router(AppState {
            engine,
            calibrator,
            admin_token: admin_token.map(str::to_string),
        })
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", t));
        }
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    fn snapshot(price: i32, captured_at: &str) -> Value {
        json!({
            "market_key": {
                "event_id": "evt-9",
                "sport": "basketball_nba",
                "bookmaker": "FanDuel",
                "market_type": "h2h",
                "outcome_name": "Denver Nuggets"
            },
            "price": price,
            "captured_at": captured_at,
            "commence_time": "2024-12-01T02:00:00Z"
        })
    }

    #[tokio::test]
    async fn snapshot_then_recommendation_then_verify() {
        let app = app(None);
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/snapshot",
            None,
            Some(snapshot(-110, "2024-11-30T18:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["inserted"], true);
        assert!(v["recommendation"].is_null());

        let (_, body) = call(
            &app,
            Method::POST,
            "/api/snapshot",
            None,
            Some(snapshot(-135, "2024-11-30T19:00:00Z")),
        )
        .await;
        let v: Value = serde_json::from_str(&body).unwrap();
        let rec = &v["recommendation"];
        let id = rec["id"].as_i64().unwrap();
        assert!(rec["signal_config_version"].as_i64().is_some());

        let key = "evt-9%7Cfanduel%7Ch2h%7CDenver%20Nuggets%7C";
        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/api/recommendation?market_key={}", key),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let latest: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(latest["id"].as_i64(), Some(id));
        assert_eq!(latest["sport"], "nba");

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/api/movement?market_key={}", key),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let movement: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(movement["price_delta"], -25);
        assert_eq!(movement["magnitude"], "moderate");

        let config_id = latest["signal_config_version"].as_i64().unwrap();
        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/api/signal-config?id={}", config_id),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cfg: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(cfg["sport"], "nba");

        let verify = json!({"recommendation_id": id, "actual_result": "win"});
        let (_, body) = call(&app, Method::POST, "/api/verify", None, Some(verify.clone())).await;
        let first: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(first["applied"], true);
        let (_, body) = call(&app, Method::POST, "/api/verify", None, Some(verify)).await;
        let second: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(second["applied"], false);
        assert_eq!(
            second["recommendation"]["verified_at"],
            first["recommendation"]["verified_at"]
        );
    }

    #[tokio::test]
    async fn unknown_recommendation_is_404() {
        let app = app(None);
        let (status, _) = call(
            &app,
            Method::GET,
            "/api/recommendation?market_key=nope",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/verify",
            None,
            Some(json!({"recommendation_id": 999, "actual_result": "loss"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_price_is_400() {
        let app = app(None);
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/snapshot",
            None,
            Some(snapshot(-99, "2024-11-30T18:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn config_writes_require_admin_token() {
        let app = app(Some("s3cret"));
        let patch = json!({"pick_threshold": 3.0});

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/signal-config?sport=nba",
            None,
            Some(patch.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/signal-config?sport=nba",
            Some("wrong"),
            Some(patch.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/signal-config?sport=nba",
            Some("s3cret"),
            Some(patch),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let stored: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stored["version"], 2);
        assert_eq!(stored["source"], "operator");
        assert_eq!(stored["config"]["pick_threshold"], 3.0);

        let (_, body) = call(&app, Method::GET, "/api/signal-config?sport=nba", None, None).await;
        let current: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(current["id"], stored["id"]);
    }

    #[tokio::test]
    async fn admin_routes_closed_without_configured_token() {
        let app = app(None);
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/calibration/run?sport=nba",
            Some("anything"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn calibration_report_flags_low_confidence() {
        let app = app(Some("tok"));
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/calibration/run?sport=nfl",
            Some("tok"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["low_confidence"], true);
        assert!(report["new_signal_config_version"].is_null());

        let (status, body) = call(&app, Method::GET, "/api/calibration?sport=nfl", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["buckets"].as_array().unwrap().len(), 10);
    }
}
