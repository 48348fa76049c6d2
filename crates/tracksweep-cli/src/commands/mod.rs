//! CLI command implementations.

pub mod config;
pub mod credentials;
pub mod gc;

use anyhow::{Context, Result};
use tracksweep_config::ServiceConfig;

fn load_config() -> Result<ServiceConfig> {
    ServiceConfig::from_env().context("Invalid configuration")
}
