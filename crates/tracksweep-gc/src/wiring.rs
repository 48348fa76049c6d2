//! Build the collector and scheduler from service configuration.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracksweep_config::{ConfigPolicySource, DatabaseConfig, GcpConfig, ServiceConfig};
use tracksweep_core::{
    AccessTokenSource, CredentialChain, Error, Result, RetentionPolicy, StorageLocation,
};
use tracksweep_db::PgRunStore;
use tracksweep_store::{
    AmbientProvider, ArtifactStoreRouter, CredentialsFileProvider, GcsArtifactStore,
    LocalArtifactStore, SecretManagerProvider, ServiceAccountFieldsProvider,
};

use crate::collector::Collector;
use crate::scheduler::{GcScheduler, SchedulerHandle};

/// Credential strategies in the order they are tried.
pub fn credential_chain(gcp: &GcpConfig) -> CredentialChain {
    CredentialChain::new(vec![
        Box::new(CredentialsFileProvider::new(gcp.credentials_file.clone())),
        Box::new(ServiceAccountFieldsProvider {
            credentials_json: gcp.credentials_json.as_ref().map(|s| s.expose().to_string()),
            client_email: gcp.client_email.clone(),
            private_key: gcp.private_key.as_ref().map(|s| s.expose().to_string()),
            project: gcp.project.clone(),
        }),
        Box::new(SecretManagerProvider::new(
            gcp.project.clone(),
            gcp.credentials_secret.as_str(),
        )),
        Box::new(AmbientProvider),
    ])
}

/// Lazy pool: the first pass, not startup, finds out whether the database is up.
pub fn connect(database: &DatabaseConfig, acquire_timeout: Duration) -> Result<PgPool> {
    tracksweep_db::create_pool(database.url.expose(), database.max_connections, acquire_timeout)
        .map_err(Error::from)
}

pub fn artifact_store(
    config: &ServiceConfig,
    tokens: Arc<dyn AccessTokenSource>,
) -> Result<ArtifactStoreRouter> {
    let root = StorageLocation::parse(&config.artifacts.artifact_root())?;

    Ok(ArtifactStoreRouter::new(Arc::new(LocalArtifactStore::new()))
        .with_gcs(Arc::new(gcs_store(config, tokens)?))
        .with_artifact_root(root))
}

pub fn gcs_store(
    config: &ServiceConfig,
    tokens: Arc<dyn AccessTokenSource>,
) -> Result<GcsArtifactStore> {
    let gcs = GcsArtifactStore::new(tokens, config.gc.call_timeout)?;
    Ok(match &config.gcp.storage_endpoint {
        Some(endpoint) => gcs.with_endpoint(endpoint.as_str()),
        None => gcs,
    })
}

pub fn collector(
    config: &ServiceConfig,
    pool: PgPool,
    tokens: Arc<dyn AccessTokenSource>,
) -> Result<Collector> {
    let runs = Arc::new(PgRunStore::new(pool, config.gc.page_size));
    let artifacts = Arc::new(artifact_store(config, tokens)?);
    let policy = Arc::new(ConfigPolicySource::from_env(RetentionPolicy::new(
        config.gc.older_than,
    )));

    Ok(Collector::new(runs, artifacts, policy, config.gc.call_timeout))
}

/// Start the scheduler, or return an inert handle when GC is disabled.
pub fn start_scheduler(
    config: &ServiceConfig,
    pool: PgPool,
    tokens: Arc<dyn AccessTokenSource>,
) -> Result<SchedulerHandle> {
    if !config.gc.enabled {
        return Ok(GcScheduler::disabled());
    }
    let collector = collector(config, pool, tokens)?;
    Ok(GcScheduler::new(collector, config.gc.interval).start())
}
