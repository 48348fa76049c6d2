//! Service configuration: optional KDL file, overridden by environment.

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable pointing at an optional KDL file.
pub const CONFIG_PATH_ENV: &str = "TRACKSWEEP_CONFIG";

pub const OLDER_THAN_ENV: &str = "MLFLOW_GC_OLDER_THAN";

const DEFAULT_FOLDER: &str = "mlflow-artifacts-v1";
const DEFAULT_INTERVAL_SECS: u64 = 20;
const DEFAULT_OLDER_THAN: &str = "5m";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PAGE_SIZE: u32 = 500;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Secret Manager secret the deployment keeps its service-account key in.
pub const DEFAULT_CREDENTIALS_SECRET: &str = "GOOGLE_APPLICATION_CREDENTIALS_MLFLOWSA";

/// A string that never shows up in logs or dumps.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[redacted]")
    }
}

/// Settings read from the KDL file. Every field is optional; the
/// environment overrides whatever is set here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemConfig {
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub bucket_location: Option<String>,
    pub folder_location: Option<String>,
    pub gcp_project: Option<String>,
    pub credentials_file: Option<String>,
    pub credentials_secret: Option<String>,
    pub storage_endpoint: Option<String>,
    pub gc_enabled: Option<bool>,
    pub gc_interval: Option<String>,
    pub older_than: Option<String>,
    pub call_timeout: Option<String>,
    pub page_size: Option<u32>,
    pub health_host: Option<String>,
    pub health_port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

/// Parse system configuration from KDL text.
///
/// ```kdl
/// database url="postgres://mlflow@db/mlflow" max-connections=5
/// artifacts bucket="gs://bucket" folder="mlflow-artifacts-v1"
/// gcp project="proj" credentials-file="/secrets/sa.json"
/// gc enabled=#true interval="20s" older-than="5m"
/// health host="0.0.0.0" port=8080
/// log level="info" format="json"
/// ```
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                config.database_url = get_string_prop(node, "url");
                config.max_connections = get_int_prop(node, "max-connections")?;
            }
            "artifacts" => {
                config.bucket_location = get_string_prop(node, "bucket");
                config.folder_location = get_string_prop(node, "folder");
            }
            "gcp" => {
                config.gcp_project = get_string_prop(node, "project");
                config.credentials_file = get_string_prop(node, "credentials-file");
                config.credentials_secret = get_string_prop(node, "secret");
                config.storage_endpoint = get_string_prop(node, "storage-endpoint");
            }
            "gc" => {
                config.gc_enabled = get_bool_prop(node, "enabled");
                config.gc_interval = get_string_prop(node, "interval");
                config.older_than = get_string_prop(node, "older-than");
                config.call_timeout = get_string_prop(node, "call-timeout");
                config.page_size = get_int_prop(node, "page-size")?;
            }
            "health" => {
                config.health_host = get_string_prop(node, "host");
                config.health_port = get_int_prop(node, "port")?;
            }
            "log" => {
                config.log_level = get_string_prop(node, "level");
                config.log_format = get_string_prop(node, "format");
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a KDL configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactConfig {
    /// `gs://bucket[/path]` or a local directory.
    pub bucket_location: String,
    pub folder: String,
}

impl ArtifactConfig {
    /// Destination the tracking server writes proxied artifacts under.
    /// The folder is not appended when the bucket location already names it.
    pub fn artifact_root(&self) -> String {
        let bucket = self.bucket_location.as_str();
        let folder = self.folder.trim_matches('/');

        if folder.is_empty() || bucket.split('/').any(|segment| segment == folder) {
            return bucket.to_string();
        }
        if bucket.ends_with('/') {
            format!("{}{}", bucket, folder)
        } else {
            format!("{}/{}", bucket, folder)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GcpConfig {
    pub project: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub credentials_json: Option<SecretString>,
    pub client_email: Option<String>,
    pub private_key: Option<SecretString>,
    /// Secret Manager secret holding a service-account key, read when a
    /// project is set.
    pub credentials_secret: String,
    /// Override for the Cloud Storage API base URL (emulators).
    pub storage_endpoint: Option<String>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: None,
            credentials_file: None,
            credentials_json: None,
            client_email: None,
            private_key: None,
            credentials_secret: DEFAULT_CREDENTIALS_SECRET.to_string(),
            storage_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GcConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub older_than: Duration,
    pub call_timeout: Duration,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Fully resolved service configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub artifacts: ArtifactConfig,
    pub gcp: GcpConfig,
    pub gc: GcConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load from the process environment, layered over the KDL file named
    /// by `TRACKSWEEP_CONFIG` when set.
    pub fn from_env() -> ConfigResult<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let system = match lookup(CONFIG_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            Some(path) => load_system_config(Path::new(path.trim()))?,
            None => SystemConfig::default(),
        };
        Self::resolve(&system, lookup)
    }

    /// Merge file settings with `lookup` (environment wins) and apply defaults.
    pub fn resolve<F>(system: &SystemConfig, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database = DatabaseConfig {
            url: SecretString::new(database_url(&env, system)?),
            max_connections: match env.get("POSTGRES_MAX_CONNECTIONS") {
                Some(v) => parse_positive("POSTGRES_MAX_CONNECTIONS", &v)?,
                None => system.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
        };

        let artifacts = ArtifactConfig {
            bucket_location: env
                .get("MLFLOW_BUCKET_LOCATION")
                .or_else(|| system.bucket_location.clone())
                .ok_or_else(|| ConfigError::MissingField("MLFLOW_BUCKET_LOCATION".to_string()))?,
            folder: env
                .get("MLFLOW_FOLDER_LOCATION")
                .or_else(|| system.folder_location.clone())
                .unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
        };

        let gcp = GcpConfig {
            project: env.get("GCP_PROJECT").or_else(|| system.gcp_project.clone()),
            credentials_file: env
                .get("GOOGLE_APPLICATION_CREDENTIALS")
                .or_else(|| system.credentials_file.clone())
                .map(PathBuf::from),
            credentials_json: env.get("GCP_CREDENTIALS_JSON").map(SecretString::new),
            client_email: env.get("GCP_CLIENT_EMAIL"),
            private_key: env
                .get("GCP_PRIVATE_KEY")
                .map(|key| SecretString::new(key.replace("\\n", "\n"))),
            credentials_secret: env
                .get("GCP_CREDENTIALS_SECRET")
                .or_else(|| system.credentials_secret.clone())
                .unwrap_or_else(|| DEFAULT_CREDENTIALS_SECRET.to_string()),
            storage_endpoint: env
                .get("GCS_ENDPOINT")
                .or_else(|| system.storage_endpoint.clone()),
        };

        let gc = GcConfig {
            enabled: match env.get("MLFLOW_GC_ENABLED") {
                Some(v) => parse_enabled(&v),
                None => system.gc_enabled.unwrap_or(true),
            },
            interval: gc_interval(&env, system),
            older_than: parse_duration(
                OLDER_THAN_ENV,
                &env.get(OLDER_THAN_ENV)
                    .or_else(|| system.older_than.clone())
                    .unwrap_or_else(|| DEFAULT_OLDER_THAN.to_string()),
            )?,
            call_timeout: match env.get("GC_CALL_TIMEOUT_SECONDS") {
                Some(v) => Duration::from_secs(parse_positive("GC_CALL_TIMEOUT_SECONDS", &v)?),
                None => match &system.call_timeout {
                    Some(v) => parse_duration("gc call-timeout", v)?,
                    None => Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
                },
            },
            page_size: match env.get("GC_PAGE_SIZE") {
                Some(v) => parse_positive("GC_PAGE_SIZE", &v)?,
                None => system.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            },
        };
        if gc.page_size == 0 {
            return Err(ConfigError::invalid("gc page-size", "must be positive"));
        }
        if gc.call_timeout.is_zero() {
            return Err(ConfigError::invalid("gc call-timeout", "must be positive"));
        }

        let health = HealthConfig {
            host: env
                .get("HEALTH_HOST")
                .or_else(|| system.health_host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: match env.get("HEALTH_PORT") {
                Some(v) => v
                    .parse()
                    .map_err(|_| ConfigError::invalid("HEALTH_PORT", format!("'{}'", v)))?,
                None => system.health_port.unwrap_or(DEFAULT_HEALTH_PORT),
            },
        };

        let logging = LoggingConfig {
            level: env
                .get("LOG_LEVEL")
                .or_else(|| system.log_level.clone())
                .unwrap_or_else(|| "info".to_string())
                .to_lowercase(),
            format: match env
                .get("LOG_FORMAT")
                .or_else(|| system.log_format.clone())
                .as_deref()
            {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        };

        Ok(Self {
            database,
            artifacts,
            gcp,
            gc,
            health,
            logging,
        })
    }
}

/// Environment lookup that treats blank values as unset.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

fn database_url<F>(env: &Env<F>, system: &SystemConfig) -> ConfigResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env
        .get("MLFLOW_POSTGRES_CONNECTION_STRING")
        .or_else(|| system.database_url.clone())
    {
        return Ok(normalize_database_url(&url));
    }

    let part = |key: &str| {
        env.get(key)
            .ok_or_else(|| ConfigError::MissingField(key.to_string()))
    };
    let host = part("POSTGRES_HOST")?;
    let port = part("POSTGRES_PORT")?;
    let db = part("POSTGRES_DB")?;
    let user = part("POSTGRES_USER")?;
    let password = part("POSTGRES_PASSWORD")?;

    Ok(format!(
        "postgres://{}:{}@{}:{}/{}",
        urlencoding::encode(&user),
        urlencoding::encode(&password),
        host,
        port,
        db
    ))
}

/// Strip surrounding quotes and SQLAlchemy driver suffixes
/// (`postgresql+psycopg2://` becomes `postgresql://`).
fn normalize_database_url(raw: &str) -> String {
    let url = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = scheme.split('+').next().unwrap_or(scheme);
            format!("{}://{}", scheme, rest)
        }
        None => url.to_string(),
    }
}

fn parse_enabled(value: &str) -> bool {
    !matches!(value.to_lowercase().as_str(), "0" | "false" | "no")
}

fn gc_interval<F>(env: &Env<F>, system: &SystemConfig) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let default = Duration::from_secs(DEFAULT_INTERVAL_SECS);
    let parsed = match (env.get("MLFLOW_GC_INTERVAL_SECONDS"), &system.gc_interval) {
        (Some(v), _) => v.parse::<u64>().ok().map(Duration::from_secs),
        (None, Some(v)) => parse_duration("gc interval", v).ok(),
        (None, None) => return default,
    };

    match parsed {
        Some(interval) if !interval.is_zero() => interval,
        _ => {
            warn!(
                default_secs = DEFAULT_INTERVAL_SECS,
                "Invalid GC interval, using default"
            );
            default
        }
    }
}

fn parse_positive<T>(field: &str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr + Default + PartialOrd,
{
    match value.parse::<T>() {
        Ok(v) if v > T::default() => Ok(v),
        _ => Err(ConfigError::invalid(
            field,
            format!("'{}' is not a positive integer", value),
        )),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_int_prop<T>(node: &KdlNode, name: &str) -> ConfigResult<Option<T>>
where
    T: TryFrom<i128>,
{
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| T::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(
                    &format!("{} {}", node.name().value(), name),
                    format!("expected an integer in range, got {}", value),
                )
            }),
    }
}
