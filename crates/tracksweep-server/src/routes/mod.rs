//! HTTP routes.

pub mod health;

use crate::AppState;
use axum::Router;

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new().merge(health::router()).with_state(state)
}
