//! Cloud Storage backend over the JSON API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracksweep_core::{
    AccessTokenSource, ArtifactStore, DeletionOutcome, Error, Result, StorageLocation,
};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

/// How a single request went wrong.
#[derive(Debug)]
enum RequestFailure {
    /// The credentials were rejected. Fatal for the whole store.
    Auth(String),
    NotFound,
    /// Worth retrying on a later pass.
    Transient(String),
}

impl RequestFailure {
    fn from_status(status: StatusCode, context: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                RequestFailure::Auth(format!("{} rejected with {}", context, status))
            }
            StatusCode::NOT_FOUND => RequestFailure::NotFound,
            _ => RequestFailure::Transient(format!("{} failed with {}", context, status)),
        }
    }
}

/// Deletes run artifacts from a Cloud Storage bucket.
pub struct GcsArtifactStore {
    client: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl GcsArtifactStore {
    pub fn new(tokens: Arc<dyn AccessTokenSource>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            tokens,
        })
    }

    /// Point at an emulator or a private endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// List every object name under `prefix`.
    ///
    /// A failure part way through returns what was listed so far together
    /// with the reason.
    async fn list_objects(
        &self,
        token: &str,
        bucket: &str,
        prefix: &str,
    ) -> std::result::Result<(Vec<String>, Option<String>), String> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, urlencoding::encode(bucket));
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(&[("prefix", prefix), ("fields", "items(name),nextPageToken")]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let page = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<ObjectList>().await {
                        Ok(page) => page,
                        Err(e) => return Ok((names, Some(format!("invalid listing: {}", e)))),
                    }
                }
                Ok(response) => match RequestFailure::from_status(response.status(), "list") {
                    RequestFailure::Auth(msg) => return Err(msg),
                    // Missing bucket: nothing to delete.
                    RequestFailure::NotFound => return Ok((names, None)),
                    RequestFailure::Transient(msg) => return Ok((names, Some(msg))),
                },
                Err(e) => return Ok((names, Some(format!("list: {}", e)))),
            };

            names.extend(page.items.into_iter().map(|item| item.name));
            debug!(bucket, prefix, listed = names.len(), "Listed objects");

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok((names, None)),
            }
        }
    }

    /// List at most one object under `location` to prove the credentials can
    /// read the bucket.
    pub async fn check_access(&self, location: &StorageLocation) -> Result<()> {
        let StorageLocation::Gcs { bucket, prefix } = location else {
            return Err(Error::InvalidInput(format!(
                "not a Cloud Storage location: {}",
                location
            )));
        };
        let token = self.tokens.access_token().await?;
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, urlencoding::encode(bucket));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[
                ("prefix", prefix.as_str()),
                ("maxResults", "1"),
                ("fields", "items(name)"),
            ])
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Cloud Storage: {}", e)))?;

        if response.status().is_success() {
            debug!(%bucket, "Bucket access verified");
            return Ok(());
        }
        match RequestFailure::from_status(response.status(), "list") {
            RequestFailure::Auth(msg) => {
                self.tokens.invalidate().await;
                Err(Error::Auth(msg))
            }
            RequestFailure::NotFound => Err(Error::NotFound(format!("bucket '{}'", bucket))),
            RequestFailure::Transient(msg) => Err(Error::BackendUnavailable(msg)),
        }
    }

    async fn delete_object(
        &self,
        token: &str,
        bucket: &str,
        name: &str,
    ) -> std::result::Result<(), RequestFailure> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(bucket),
            urlencoding::encode(name)
        );

        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RequestFailure::Transient(format!("delete: {}", e)))?;

        if response.status().is_success() {
            return Ok(());
        }
        match RequestFailure::from_status(response.status(), "delete") {
            // Someone else got there first.
            RequestFailure::NotFound => Ok(()),
            failure => Err(failure),
        }
    }
}

#[async_trait]
impl ArtifactStore for GcsArtifactStore {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn delete_tree(&self, location: &StorageLocation) -> Result<DeletionOutcome> {
        let StorageLocation::Gcs { bucket, prefix } = location else {
            return Err(Error::InvalidInput(format!(
                "not a Cloud Storage location: {}",
                location
            )));
        };
        if prefix.is_empty() {
            return Err(Error::InvalidInput(format!(
                "refusing to delete the whole bucket '{}'",
                bucket
            )));
        }
        // Trailing slash keeps "runs/ab" from matching "runs/abc".
        let prefix = format!("{}/", prefix);

        let token = self.tokens.access_token().await?;

        let (names, mut failure) = match self.list_objects(&token, bucket, &prefix).await {
            Ok(listed) => listed,
            Err(msg) => {
                self.tokens.invalidate().await;
                return Err(Error::Auth(msg));
            }
        };

        if names.is_empty() && failure.is_none() {
            debug!(%location, "No artifacts under location");
            return Ok(DeletionOutcome::AlreadyAbsent);
        }

        let mut deleted = 0u64;
        let mut remaining = 0u64;
        for name in &names {
            match self.delete_object(&token, bucket, name).await {
                Ok(()) => deleted += 1,
                Err(RequestFailure::Auth(msg)) => {
                    // A revoked token must not outlive this pass in the cache.
                    self.tokens.invalidate().await;
                    return Err(Error::Auth(msg));
                }
                Err(RequestFailure::NotFound) => deleted += 1,
                Err(RequestFailure::Transient(msg)) => {
                    warn!(bucket, object = %name, error = %msg, "Failed to delete object");
                    remaining += 1;
                    failure = Some(msg);
                }
            }
        }

        match failure {
            Some(reason) => Ok(DeletionOutcome::PartialFailure { remaining, reason }),
            None => {
                info!(%location, objects = deleted, "Deleted artifacts");
                Ok(DeletionOutcome::Deleted { objects: deleted })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracksweep_core::credentials::StaticToken;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LIST_PATH: &str = "/storage/v1/b/bucket/o";

    fn store(server: &MockServer) -> GcsArtifactStore {
        GcsArtifactStore::new(
            Arc::new(StaticToken("tok".to_string())),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_endpoint(server.uri())
    }

    fn location() -> StorageLocation {
        StorageLocation::parse("gs://bucket/mlflow-artifacts-v1/1/abc/artifacts").unwrap()
    }

    fn listing(names: &[&str]) -> ResponseTemplate {
        let items: Vec<_> = names.iter().map(|n| serde_json::json!({ "name": n })).collect();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": items }))
    }

    async fn mount_delete(server: &MockServer, object: &str, status: u16, times: u64) {
        Mock::given(method("DELETE"))
            .and(path(format!("{}/{}", LIST_PATH, urlencoding::encode(object))))
            .respond_with(ResponseTemplate::new(status))
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_deletes_every_listed_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("prefix", "mlflow-artifacts-v1/1/abc/artifacts/"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(listing(&[
                "mlflow-artifacts-v1/1/abc/artifacts/model.pkl",
                "mlflow-artifacts-v1/1/abc/artifacts/plots/loss.png",
            ]))
            .expect(1)
            .mount(&server)
            .await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/model.pkl", 204, 1).await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/plots/loss.png", 204, 1).await;

        let outcome = store(&server).delete_tree(&location()).await.unwrap();
        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 2 });
    }

    #[tokio::test]
    async fn test_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("pageToken", "p2"))
            .respond_with(listing(&["mlflow-artifacts-v1/1/abc/artifacts/b"]))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "mlflow-artifacts-v1/1/abc/artifacts/a" }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/a", 204, 1).await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/b", 204, 1).await;

        let outcome = store(&server).delete_tree(&location()).await.unwrap();
        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 2 });
    }

    #[tokio::test]
    async fn test_empty_prefix_is_already_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let outcome = store(&server).delete_tree(&location()).await.unwrap();
        assert_eq!(outcome, DeletionOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_object_gone_during_delete_counts_as_deleted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(listing(&["mlflow-artifacts-v1/1/abc/artifacts/model.pkl"]))
            .mount(&server)
            .await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/model.pkl", 404, 1).await;

        let outcome = store(&server).delete_tree(&location()).await.unwrap();
        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 1 });
    }

    #[tokio::test]
    async fn test_server_error_is_partial_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(listing(&[
                "mlflow-artifacts-v1/1/abc/artifacts/a",
                "mlflow-artifacts-v1/1/abc/artifacts/b",
            ]))
            .mount(&server)
            .await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/a", 204, 1).await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/b", 503, 1).await;

        let outcome = store(&server).delete_tree(&location()).await.unwrap();
        assert!(matches!(
            outcome,
            DeletionOutcome::PartialFailure { remaining: 1, .. }
        ));
        assert!(!outcome.is_complete());
    }

    #[tokio::test]
    async fn test_listing_failure_is_partial_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let outcome = store(&server).delete_tree(&location()).await.unwrap();
        assert!(!outcome.is_complete());
    }

    #[derive(Default)]
    struct CountingTokens {
        invalidated: AtomicUsize,
    }

    #[async_trait]
    impl AccessTokenSource for CountingTokens {
        async fn access_token(&self) -> Result<String> {
            Ok("tok".to_string())
        }

        async fn invalidate(&self) {
            self.invalidated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_store(server: &MockServer, tokens: Arc<CountingTokens>) -> GcsArtifactStore {
        GcsArtifactStore::new(tokens, Duration::from_secs(5))
            .unwrap()
            .with_endpoint(server.uri())
    }

    #[tokio::test]
    async fn test_forbidden_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(listing(&["mlflow-artifacts-v1/1/abc/artifacts/a"]))
            .mount(&server)
            .await;
        mount_delete(&server, "mlflow-artifacts-v1/1/abc/artifacts/a", 403, 1).await;
        let tokens = Arc::new(CountingTokens::default());

        let err = counting_store(&server, tokens.clone())
            .delete_tree(&location())
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(tokens.invalidated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_listing_drops_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let tokens = Arc::new(CountingTokens::default());

        let err = counting_store(&server, tokens.clone())
            .delete_tree(&location())
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(tokens.invalidated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let tokens = Arc::new(CountingTokens::default());

        counting_store(&server, tokens.clone())
            .delete_tree(&location())
            .await
            .unwrap();
        assert_eq!(tokens.invalidated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_access_lists_one_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("maxResults", "1"))
            .and(query_param("prefix", "mlflow-artifacts-v1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(listing(&["mlflow-artifacts-v1/0/abc/artifacts/m.pkl"]))
            .expect(1)
            .mount(&server)
            .await;

        let root = StorageLocation::parse("gs://bucket/mlflow-artifacts-v1").unwrap();
        store(&server).check_access(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_access_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/missing/o"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let store = store(&server);

        let denied = StorageLocation::parse("gs://bucket/mlflow-artifacts-v1").unwrap();
        assert!(store.check_access(&denied).await.unwrap_err().is_auth());

        let missing = StorageLocation::parse("gs://missing/mlflow-artifacts-v1").unwrap();
        assert!(store.check_access(&missing).await.unwrap_err().is_not_found());

        let local = StorageLocation::parse("/srv/artifacts").unwrap();
        assert!(matches!(
            store.check_access(&local).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_refuses_bucket_root() {
        let server = MockServer::start().await;
        let root = StorageLocation::parse("gs://bucket").unwrap();
        let err = store(&server).delete_tree(&root).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_rejects_local_location() {
        let server = MockServer::start().await;
        let local = StorageLocation::parse("/tmp/mlruns").unwrap();
        assert!(store(&server).delete_tree(&local).await.is_err());
    }
}
