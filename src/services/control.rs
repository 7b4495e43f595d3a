//! Operator control server
//!
//! Small HTTP surface over a running engine: status, graceful stop,
//! kill-switch reset, configuration reload and external exit triggers.
//! The `panther` subcommands are thin clients of these routes.

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::TradingMode;
use crate::coordination::ShutdownSignal;
use crate::domain::KillSwitchState;
use crate::error::PantherError;
use crate::exchange::VenueLatency;

/// Kill switch as reported to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchView {
    pub engaged: bool,
    pub reason: Option<String>,
    pub engaged_at: Option<DateTime<Utc>>,
    pub high_water_mark: Decimal,
    pub last_reset_by: Option<String>,
}

impl From<&KillSwitchState> for KillSwitchView {
    fn from(state: &KillSwitchState) -> Self {
        Self {
            engaged: state.engaged,
            reason: state.reason.clone(),
            engaged_at: state.engaged_at,
            high_water_mark: state.high_water_mark,
            last_reset_by: state.last_reset_by.clone(),
        }
    }
}

/// `GET /status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub mode: TradingMode,
    pub kill_switch: KillSwitchView,
    pub open_positions_count: usize,
    pub daily_pnl: Decimal,
    pub equity: Decimal,
    pub strategies: Vec<String>,
    #[serde(default)]
    pub venues: Vec<VenueLatency>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub operator: Option<String>,
}

/// What the control server needs from the engine
#[async_trait]
pub trait EngineControl: Send + Sync {
    async fn status(&self) -> Result<EngineStatus, PantherError>;

    /// Begin a graceful drain; returns immediately
    fn request_stop(&self);

    async fn reset_kill_switch(&self, operator: &str) -> Result<KillSwitchState, PantherError>;

    /// Re-read and re-validate configuration, then rewrite allocations
    async fn reload(&self) -> Result<Vec<String>, PantherError>;

    async fn trigger_exit(&self, strategy_id: &str, symbol: &str) -> Result<String, String>;
}

type SharedControl = Arc<dyn EngineControl>;

pub fn router(control: SharedControl) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/stop", post(stop_handler))
        .route("/kill-switch/reset", post(reset_handler))
        .route("/reload", post(reload_handler))
        .route("/strategies/:id/exit/:symbol", post(exit_handler))
        .with_state(control)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

async fn status_handler(State(control): State<SharedControl>) -> impl IntoResponse {
    match control.status().await {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn stop_handler(State(control): State<SharedControl>) -> impl IntoResponse {
    info!("Stop requested via control server");
    control.request_stop();
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "stopping": true })))
}

async fn reset_handler(
    State(control): State<SharedControl>,
    body: Option<Json<ResetRequest>>,
) -> impl IntoResponse {
    let operator = body
        .and_then(|Json(r)| r.operator)
        .unwrap_or_else(|| "operator".to_string());
    match control.reset_kill_switch(&operator).await {
        Ok(state) => (
            StatusCode::OK,
            Json(serde_json::json!(KillSwitchView::from(&state))),
        ),
        Err(e) => {
            warn!(error = %e, "Kill switch reset failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn reload_handler(State(control): State<SharedControl>) -> impl IntoResponse {
    match control.reload().await {
        Ok(strategies) => (
            StatusCode::OK,
            Json(serde_json::json!({ "reloaded": true, "allocations": strategies })),
        ),
        Err(PantherError::InvalidConfig(problems)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "invalid configuration", "problems": problems })),
        ),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn exit_handler(
    State(control): State<SharedControl>,
    Path((strategy_id, symbol)): Path<(String, String)>,
) -> impl IntoResponse {
    match control.trigger_exit(&strategy_id, &symbol).await {
        Ok(message) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "strategy": strategy_id, "symbol": symbol, "result": message })),
        ),
        Err(e) => error_body(StatusCode::CONFLICT, e),
    }
}

/// Serve the control routes until shutdown is signalled
pub async fn serve(
    control: SharedControl,
    bind: &str,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), PantherError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| PantherError::Internal(format!("invalid control bind {}: {}", bind, e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control server listening on {}", addr);

    axum::serve(listener, router(control))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| PantherError::Internal(format!("control server error: {}", e)))
}
