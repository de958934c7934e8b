// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `/health` requires no authentication.
// Everything else requires a valid Bearer token checked via the `AuthBearer`
// extractor. Responses use the `EngineResult` envelope described in the
// external interface contract: `{success, data?, error?, error_code?}`.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::error::EngineResult;
use crate::types::{FollowupAction, Signal};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/signals", post(ingest_signal))
        .route("/api/v1/alerts", post(ingest_alert))
        .route("/api/v1/trades/:id", get(get_trade))
        .route("/api/v1/trades/by-coin/:coin", get(trades_by_coin))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", server_time: Utc::now().timestamp_millis() })
}

fn status_for(err: &crate::error::EngineError) -> StatusCode {
    use crate::error::EngineError;
    if err.is_retryable() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match err {
        EngineError::Validation(_)
        | EngineError::UnsupportedSymbol(_)
        | EngineError::InsufficientNotional { .. }
        | EngineError::OutOfRange
        | EngineError::CooldownActive { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::PositionNotFound(_) | EngineError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_envelope<T: Serialize>(err: crate::error::EngineError) -> (StatusCode, Json<EngineResult<T>>) {
    let status = status_for(&err);
    (status, Json(EngineResult::err(&err)))
}

/// Ingest a normalized entry signal and run it through the full
/// signal-to-order pipeline for its trader's configured exchange.
async fn ingest_signal(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(signal): Json<Signal>,
) -> impl IntoResponse {
    info!(coin = %signal.coin_symbol, trader = %signal.trader, "signal received");
    match state.handle_signal(signal).await {
        Ok(trade) => (StatusCode::CREATED, Json(EngineResult::ok(trade))).into_response(),
        Err(e) => {
            warn!(error = %e, "signal processing failed");
            error_envelope::<()>(e).into_response()
        }
    }
}

/// Wire shape for a follow-up alert. `discord_id` is the upstream chat
/// platform's own message id, carried for traceability in logs only — it
/// has no persisted column on `Alert`.
#[derive(Debug, Deserialize)]
struct IngestAlertRequest {
    timestamp: DateTime<Utc>,
    content: String,
    trade: String,
    #[serde(default)]
    discord_id: Option<String>,
    trader: String,
    #[serde(default)]
    coin_symbol: Option<String>,
    #[serde(default)]
    trade_group_id: Option<String>,
    #[serde(default)]
    parsed_action: Option<FollowupAction>,
}

async fn ingest_alert(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestAlertRequest>,
) -> impl IntoResponse {
    info!(trader = %req.trader, trade = %req.trade, discord_id = ?req.discord_id, "follow-up alert received");

    let alert = crate::types::Alert {
        id: 0,
        trade_source_message_id: req.trade,
        trader: req.trader,
        coin_symbol: req.coin_symbol,
        timestamp: req.timestamp,
        content: req.content,
        parsed_action: req.parsed_action,
        status: crate::types::AlertStatus::Pending,
        trade_group_id: req.trade_group_id,
    };

    let persisted = match state.alerts.insert(alert).await {
        Ok(persisted) => persisted,
        Err(e) => return error_envelope::<()>(e).into_response(),
    };

    match state.handle_alert(persisted).await {
        Ok(outcome) => (StatusCode::OK, Json(EngineResult::ok(format!("{outcome:?}")))).into_response(),
        Err(e) => {
            warn!(error = %e, "follow-up dispatch failed");
            error_envelope::<()>(e).into_response()
        }
    }
}

async fn get_trade(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> impl IntoResponse {
    match state.trades.get(id).await {
        Ok(trade) => Json(EngineResult::ok(trade)).into_response(),
        Err(e) => error_envelope::<()>(e).into_response(),
    }
}

async fn trades_by_coin(_auth: AuthBearer, State(state): State<Arc<AppState>>, Path(coin): Path<String>) -> impl IntoResponse {
    match state.trades.find_by_coin(&coin).await {
        Ok(trades) => Json(EngineResult::ok(trades)).into_response(),
        Err(e) => error_envelope::<()>(e).into_response(),
    }
}
