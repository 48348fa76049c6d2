//! Application state.

use sqlx::PgPool;
use tokio::sync::watch;
use tracksweep_gc::SchedulerStatus;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub scheduler: watch::Receiver<SchedulerStatus>,
}

impl AppState {
    pub fn new(pool: PgPool, scheduler: watch::Receiver<SchedulerStatus>) -> Self {
        Self { pool, scheduler }
    }
}
