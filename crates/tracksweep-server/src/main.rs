//! tracksweep retention service

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracksweep_config::{LoggingConfig, ServiceConfig};
use tracksweep_gc::wiring;
use tracksweep_server::telemetry::init_tracing;
use tracksweep_server::{AppState, routes};

/// How long a GC call waits for a pooled database connection.
const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging settings come from the same configuration, so a broken
    // configuration is still reported through a default subscriber.
    let config = ServiceConfig::from_env();
    match &config {
        Ok(config) => init_tracing(&config.logging),
        Err(_) => init_tracing(&LoggingConfig::default()),
    }
    let config = config.context("Invalid configuration")?;

    info!(
        gc_enabled = config.gc.enabled,
        interval_secs = config.gc.interval.as_secs(),
        older_than_secs = config.gc.older_than.as_secs(),
        artifact_root = %config.artifacts.artifact_root(),
        "Starting tracksweep"
    );

    let pool = wiring::connect(&config.database, DB_ACQUIRE_TIMEOUT)?;
    let credentials = Arc::new(wiring::credential_chain(&config.gcp));
    info!(strategies = ?credentials.strategies(), "Credential chain configured");

    let scheduler = wiring::start_scheduler(&config, pool.clone(), credentials)?;
    let state = AppState::new(pool, scheduler.subscribe());

    let app = routes::router(state).layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind((config.health.host.as_str(), config.health.port))
        .await
        .with_context(|| {
            format!(
                "Failed to bind health server on {}:{}",
                config.health.host, config.health.port
            )
        })?;
    info!(addr = %listener.local_addr()?, "Health server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Waiting for the GC scheduler to finish its current run");
    scheduler.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
