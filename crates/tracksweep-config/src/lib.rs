//! Configuration for tracksweep.
//!
//! This crate handles:
//! - Environment variables (names shared with the tracking server deployment)
//! - An optional KDL system configuration file
//! - Retention duration strings
//! - Re-reading the retention policy between passes

pub mod duration;
pub mod error;
pub mod policy_source;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use policy_source::ConfigPolicySource;
pub use system::{
    ArtifactConfig, DEFAULT_CREDENTIALS_SECRET, DatabaseConfig, GcConfig, GcpConfig,
    HealthConfig, LogFormat, LoggingConfig, SecretString, ServiceConfig, SystemConfig,
    parse_system_config,
};
