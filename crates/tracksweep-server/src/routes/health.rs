//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};
use tracing::warn;
use tracksweep_gc::SchedulerStatus;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/gc", get(gc_status))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready when the tracking database answers.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let scheduler = state.scheduler.borrow().clone();

    match tracksweep_db::ping(&state.pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "database": "ok",
                "gc": {
                    "enabled": scheduler.enabled,
                    "state": scheduler.state,
                    "passes": scheduler.passes,
                    "last_error": scheduler.last_error,
                },
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "database": e.to_string(),
                    "gc": {
                        "enabled": scheduler.enabled,
                        "state": scheduler.state,
                    },
                })),
            )
        }
    }
}

/// Scheduler status including the last pass summary.
async fn gc_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.borrow().clone())
}
