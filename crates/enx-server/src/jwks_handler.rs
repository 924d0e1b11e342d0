//! HTTP trigger for JWKS reconciliation.
//!
//! `POST /` runs one `update_all` cycle; the scheduler (cron, Cloud
//! Scheduler, systemd timer) decides cadence. A cycle skipped because
//! another deployment holds the lease is a success, not an error.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Value, json};
use tracing::error;

use enx_auth::{JwksManager, UpdateOutcome};

/// Builds the JWKS trigger router.
pub fn router(manager: Arc<JwksManager>) -> Router {
    Router::new()
        .route("/", post(update_all))
        .route("/health", get(health))
        .with_state(manager)
}

async fn update_all(State(manager): State<Arc<JwksManager>>) -> (StatusCode, Json<Value>) {
    match manager.update_all().await {
        Ok(UpdateOutcome::Updated) => (StatusCode::OK, Json(json!({"status": "updated"}))),
        Ok(UpdateOutcome::AlreadyLocked) => {
            (StatusCode::OK, Json(json!({"status": "already locked"})))
        }
        Err(e) => {
            error!(error = %e, "jwks update failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error"})),
            )
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
