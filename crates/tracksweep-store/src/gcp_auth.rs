//! Google Cloud credential strategies.
//!
//! Each strategy is a [`CredentialProvider`]; the service wires them into a
//! [`tracksweep_core::CredentialChain`] in a fixed order:
//!
//! 1. a service account key file on disk
//! 2. service account fields passed through the environment
//! 3. a key stored in Secret Manager
//! 4. application default credentials of the host

use async_trait::async_trait;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_secretmanager_v1::client::SecretManagerService;
use google_cloud_token::TokenSourceProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};
use tracksweep_core::{AccessTokenSource, CredentialProvider, Error, Result};

/// Scope covering Cloud Storage and Secret Manager.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Refresh tokens this long before they expire.
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// Google OAuth access tokens live for an hour.
const TOKEN_CACHE_DURATION_SECS: u64 = 3600;

#[derive(Clone)]
enum GoogleCredentials {
    /// Application default credentials.
    Ambient,
    /// Service account key JSON.
    ServiceAccount(Arc<String>),
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Access tokens minted by google-cloud-auth, cached until shortly before expiry.
pub struct GoogleTokenSource {
    credentials: GoogleCredentials,
    cache: RwLock<Option<CachedToken>>,
}

impl GoogleTokenSource {
    pub fn ambient() -> Self {
        Self::with_credentials(GoogleCredentials::Ambient)
    }

    /// Token source for a service account key. The key is validated eagerly.
    pub fn service_account(json: impl Into<String>) -> Result<Self> {
        let json = json.into();
        parse_credentials(&json)?;
        Ok(Self::with_credentials(GoogleCredentials::ServiceAccount(
            Arc::new(json),
        )))
    }

    fn with_credentials(credentials: GoogleCredentials) -> Self {
        Self {
            credentials,
            cache: RwLock::new(None),
        }
    }

    async fn cached(&self) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|c| c.expires_at > Instant::now() + Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS))
            .map(|c| c.token.clone())
    }

    async fn fetch(&self) -> Result<String> {
        let config =
            google_cloud_auth::project::Config::default().with_scopes(&[CLOUD_PLATFORM_SCOPE]);

        let provider = match &self.credentials {
            GoogleCredentials::Ambient => {
                google_cloud_auth::token::DefaultTokenSourceProvider::new(config).await
            }
            GoogleCredentials::ServiceAccount(json) => {
                let creds = parse_credentials(json)?;
                google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
                    config,
                    Box::new(creds),
                )
                .await
            }
        }
        .map_err(|e| Error::Auth(format!("failed to create token source: {}", e)))?;

        let token = provider
            .token_source()
            .token()
            .await
            .map_err(|e| Error::Auth(format!("failed to get access token: {}", e)))?;

        Ok(strip_bearer(&token).to_string())
    }
}

#[async_trait]
impl AccessTokenSource for GoogleTokenSource {
    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let token = self.fetch().await?;
        debug!("Refreshed Google access token");

        let mut cache = self.cache.write().await;
        *cache = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(TOKEN_CACHE_DURATION_SECS),
        });
        Ok(token)
    }

    async fn invalidate(&self) {
        if self.cache.write().await.take().is_some() {
            debug!("Dropped rejected Google access token");
        }
    }
}

fn parse_credentials(json: &str) -> Result<CredentialsFile> {
    serde_json::from_str(json)
        .map_err(|e| Error::Auth(format!("invalid service account key: {}", e)))
}

/// google-cloud-auth returns tokens in header form.
fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

/// Service account key file, usually `GOOGLE_APPLICATION_CREDENTIALS`.
pub struct CredentialsFileProvider {
    path: Option<PathBuf>,
}

impl CredentialsFileProvider {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CredentialProvider for CredentialsFileProvider {
    fn name(&self) -> &'static str {
        "credentials-file"
    }

    async fn resolve(&self) -> Result<Option<Arc<dyn AccessTokenSource>>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Credentials file does not exist, skipping");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::Auth(format!(
                    "failed to read credentials file '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        Ok(Some(Arc::new(GoogleTokenSource::service_account(json)?)))
    }
}

/// Service account key given inline, either whole or as separate fields.
#[derive(Default)]
pub struct ServiceAccountFieldsProvider {
    pub credentials_json: Option<String>,
    pub client_email: Option<String>,
    pub private_key: Option<String>,
    pub project: Option<String>,
}

impl ServiceAccountFieldsProvider {
    fn key_json(&self) -> Option<String> {
        if let Some(json) = &self.credentials_json {
            return Some(json.clone());
        }

        let (email, key) = (self.client_email.as_ref()?, self.private_key.as_ref()?);
        // Keys passed through env files often carry literal "\n" sequences.
        let key = key.replace("\\n", "\n");
        let value = serde_json::json!({
            "type": "service_account",
            "client_email": email,
            "private_key": key,
            "project_id": self.project,
            "token_uri": "https://oauth2.googleapis.com/token",
        });
        Some(value.to_string())
    }
}

#[async_trait]
impl CredentialProvider for ServiceAccountFieldsProvider {
    fn name(&self) -> &'static str {
        "service-account-env"
    }

    async fn resolve(&self) -> Result<Option<Arc<dyn AccessTokenSource>>> {
        match self.key_json() {
            Some(json) => Ok(Some(Arc::new(GoogleTokenSource::service_account(json)?))),
            None => Ok(None),
        }
    }
}

/// Reads the latest version of a secret.
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// `Ok(None)` when the secret or its latest version does not exist.
    async fn latest(&self, project: &str, secret: &str) -> Result<Option<Vec<u8>>>;
}

/// Secret Manager client authenticated with the host's default credentials.
#[derive(Default)]
pub struct SecretManagerReader {
    client: OnceCell<SecretManagerService>,
}

impl SecretManagerReader {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<&SecretManagerService> {
        self.client
            .get_or_try_init(|| async {
                SecretManagerService::builder().build().await.map_err(|e| {
                    Error::BackendUnavailable(format!("failed to create Secret Manager client: {}", e))
                })
            })
            .await
    }
}

#[async_trait]
impl SecretReader for SecretManagerReader {
    async fn latest(&self, project: &str, secret: &str) -> Result<Option<Vec<u8>>> {
        let name = format!("projects/{}/secrets/{}/versions/latest", project, secret);

        match self
            .client()
            .await?
            .access_secret_version()
            .set_name(&name)
            .send()
            .await
        {
            Ok(response) => Ok(response.payload.map(|payload| payload.data.to_vec())),
            Err(e) => {
                let message = e.to_string();
                if message.contains("NOT_FOUND") || message.contains("status: NotFound") {
                    Ok(None)
                } else if message.contains("PERMISSION_DENIED")
                    || message.contains("UNAUTHENTICATED")
                    || message.contains("status: PermissionDenied")
                {
                    Err(Error::Auth(format!("secret manager denied '{}': {}", name, e)))
                } else {
                    Err(Error::BackendUnavailable(format!("secret manager: {}", e)))
                }
            }
        }
    }
}

/// Service account key stored as the latest version of a Secret Manager secret.
///
/// Applies whenever a project is configured.
pub struct SecretManagerProvider {
    project: Option<String>,
    secret: String,
    reader: Arc<dyn SecretReader>,
}

impl SecretManagerProvider {
    pub fn new(project: Option<String>, secret: impl Into<String>) -> Self {
        Self {
            project,
            secret: secret.into(),
            reader: Arc::new(SecretManagerReader::new()),
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn SecretReader>) -> Self {
        self.reader = reader;
        self
    }
}

#[async_trait]
impl CredentialProvider for SecretManagerProvider {
    fn name(&self) -> &'static str {
        "secret-manager"
    }

    async fn resolve(&self) -> Result<Option<Arc<dyn AccessTokenSource>>> {
        let Some(project) = &self.project else {
            return Ok(None);
        };

        let Some(bytes) = self.reader.latest(project, &self.secret).await? else {
            debug!(project = %project, secret = %self.secret, "No credentials secret");
            return Ok(None);
        };
        let json = String::from_utf8(bytes)
            .map_err(|_| Error::Auth(format!("secret '{}' is not valid UTF-8", self.secret)))?;

        Ok(Some(Arc::new(GoogleTokenSource::service_account(json)?)))
    }
}

/// Application default credentials: metadata server, gcloud login, workload identity.
pub struct AmbientProvider;

#[async_trait]
impl CredentialProvider for AmbientProvider {
    fn name(&self) -> &'static str {
        "ambient"
    }

    async fn resolve(&self) -> Result<Option<Arc<dyn AccessTokenSource>>> {
        let source = GoogleTokenSource::ambient();
        // Mint once so an unusable environment falls through the chain.
        source.access_token().await?;
        Ok(Some(Arc::new(source)))
    }
}
