//! Retention service for tracksweep.
//!
//! Runs the GC scheduler in the background and serves health endpoints.

pub mod routes;
pub mod state;
pub mod telemetry;

pub use state::AppState;
