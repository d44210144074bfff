//! HTTP trigger and status endpoints.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db;
use crate::sync::{Syncer, TriggerError};

#[derive(Clone)]
pub struct AppState {
    pub syncer: Arc<Syncer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(trigger_sync))
        .route("/sync/status", get(sync_status))
        .route("/sync/runs", get(sync_runs))
        .with_state(state)
}

/// Runs the sync and waits for it; the response carries the run's own code.
/// The run is spawned so a client disconnect does not cancel it.
pub async fn trigger_sync(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let syncer = state.syncer.clone();
    let outcome = match tokio::spawn(async move { syncer.trigger().await }).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(?err, "sync task did not finish");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "sync task aborted", "status": "failed", "code": 500 })),
            );
        }
    };
    match outcome {
        Ok(summary) => {
            let code = StatusCode::from_u16(summary.code).unwrap_or(StatusCode::OK);
            let body = serde_json::to_value(&summary).unwrap_or_else(|_| json!({}));
            (code, Json(body))
        }
        Err(TriggerError::AlreadyRunning { since }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "message": "sync already in progress",
                "status": "already_running",
                "running_since": since,
                "code": 409,
            })),
        ),
    }
}

pub async fn sync_status(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.syncer.status().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(serde_json::to_value(snapshot).unwrap_or_else(|_| json!({}))),
        ),
        Err(err) => {
            error!(?err, "failed to read sync status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": err.to_string(), "code": 500 })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RunsResponse {
    runs: Vec<db::SyncRunRow>,
}

pub async fn sync_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> (StatusCode, Json<Value>) {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match db::recent_runs(state.syncer.pool(), limit).await {
        Ok(runs) => (
            StatusCode::OK,
            Json(serde_json::to_value(RunsResponse { runs }).unwrap_or_else(|_| json!({}))),
        ),
        Err(err) => {
            error!(?err, "failed to list sync runs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": err.to_string(), "code": 500 })),
            )
        }
    }
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}
