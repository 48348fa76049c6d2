//! Dispatch artifact deletions to the backend owning the location.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use tracksweep_core::{ArtifactStore, DeletionOutcome, Error, Result, StorageLocation};

/// Routes each location to a backend by scheme.
///
/// Proxied locations (`mlflow-artifacts:/...`) are resolved against the
/// tracking server's artifact root first.
pub struct ArtifactStoreRouter {
    artifact_root: Option<StorageLocation>,
    gcs: Option<Arc<dyn ArtifactStore>>,
    local: Arc<dyn ArtifactStore>,
}

impl ArtifactStoreRouter {
    pub fn new(local: Arc<dyn ArtifactStore>) -> Self {
        Self {
            artifact_root: None,
            gcs: None,
            local,
        }
    }

    pub fn with_gcs(mut self, gcs: Arc<dyn ArtifactStore>) -> Self {
        self.gcs = Some(gcs);
        self
    }

    pub fn with_artifact_root(mut self, root: StorageLocation) -> Self {
        self.artifact_root = Some(root);
        self
    }

    /// Turn a proxied location into the concrete one it stands for.
    ///
    /// A location that is the artifact root, or holds it, is refused: it
    /// would take every other run's artifacts with it.
    pub fn resolve(&self, location: &StorageLocation) -> Result<StorageLocation> {
        let resolved = match (location, &self.artifact_root) {
            (StorageLocation::Proxied { .. }, Some(StorageLocation::Proxied { .. }) | None) => {
                return Err(Error::InvalidInput(format!(
                    "cannot resolve '{}' without a concrete artifact root",
                    location
                )));
            }
            (StorageLocation::Proxied { path }, Some(root)) => root.join(path)?,
            _ => location.clone(),
        };

        if let Some(root) = &self.artifact_root {
            if resolved.contains(root) {
                return Err(Error::InvalidInput(format!(
                    "'{}' covers the artifact root '{}'",
                    resolved, root
                )));
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ArtifactStore for ArtifactStoreRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn delete_tree(&self, location: &StorageLocation) -> Result<DeletionOutcome> {
        let resolved = self.resolve(location)?;
        let store = match &resolved {
            StorageLocation::Gcs { .. } => self.gcs.as_ref().ok_or_else(|| {
                Error::InvalidInput(format!("no Cloud Storage backend for '{}'", resolved))
            })?,
            StorageLocation::Local { .. } => &self.local,
            StorageLocation::Proxied { .. } => {
                return Err(Error::InvalidInput(format!("unresolved location '{}'", resolved)));
            }
        };

        debug!(backend = store.name(), location = %resolved, "Deleting artifact tree");
        store.delete_tree(&resolved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalArtifactStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<StorageLocation>>,
    }

    #[async_trait]
    impl ArtifactStore for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn delete_tree(&self, location: &StorageLocation) -> Result<DeletionOutcome> {
            self.seen.lock().unwrap().push(location.clone());
            Ok(DeletionOutcome::Deleted { objects: 1 })
        }
    }

    #[tokio::test]
    async fn test_proxied_resolves_against_root() {
        let gcs = Arc::new(Recording::default());
        let router = ArtifactStoreRouter::new(Arc::new(Recording::default()))
            .with_gcs(gcs.clone())
            .with_artifact_root(StorageLocation::parse("gs://bucket/mlflow-artifacts-v1").unwrap());

        let proxied = StorageLocation::parse("mlflow-artifacts:/2/abc/artifacts").unwrap();
        router.delete_tree(&proxied).await.unwrap();

        assert_eq!(
            gcs.seen.lock().unwrap()[0],
            StorageLocation::Gcs {
                bucket: "bucket".to_string(),
                prefix: "mlflow-artifacts-v1/2/abc/artifacts".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_local_goes_to_local_backend() {
        let local = Arc::new(Recording::default());
        let router = ArtifactStoreRouter::new(local.clone());

        let location = StorageLocation::parse("file:///data/mlruns/0/abc/artifacts").unwrap();
        router.delete_tree(&location).await.unwrap();
        assert_eq!(local.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gcs_without_backend_is_rejected() {
        let router = ArtifactStoreRouter::new(Arc::new(Recording::default()));
        let location = StorageLocation::parse("gs://bucket/p/abc").unwrap();
        assert!(matches!(
            router.delete_tree(&location).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_root_and_its_ancestors_are_refused() {
        let gcs = Arc::new(Recording::default());
        let router = ArtifactStoreRouter::new(Arc::new(Recording::default()))
            .with_gcs(gcs.clone())
            .with_artifact_root(StorageLocation::parse("gs://bucket/mlflow-artifacts-v1").unwrap());

        for uri in ["gs://bucket/mlflow-artifacts-v1", "gs://bucket/"] {
            let location = StorageLocation::parse(uri).unwrap();
            assert!(
                matches!(router.delete_tree(&location).await, Err(Error::InvalidInput(_))),
                "{} should be refused",
                uri
            );
        }

        // A sibling prefix sharing the root's name is fine.
        let sibling = StorageLocation::parse("gs://bucket/mlflow-artifacts-v1-old/0/abc").unwrap();
        router.delete_tree(&sibling).await.unwrap();
        assert_eq!(gcs.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_proxied_path_cannot_escape_root() {
        let router = ArtifactStoreRouter::new(Arc::new(Recording::default()))
            .with_artifact_root(StorageLocation::parse("/srv/artifacts").unwrap());

        for path in ["", "..", "../victim", "0/../../victim", "."] {
            let location = StorageLocation::Proxied {
                path: path.to_string(),
            };
            assert!(
                matches!(router.resolve(&location), Err(Error::InvalidInput(_))),
                "{:?} should be rejected",
                path
            );
        }
    }

    #[tokio::test]
    async fn test_other_runs_survive_a_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("artifacts-root");
        let other_run = root.join("0").join("otherrun").join("artifacts");
        let victim = dir.path().join("victim");
        std::fs::create_dir_all(&other_run).unwrap();
        std::fs::write(other_run.join("m.pkl"), b"m").unwrap();
        std::fs::create_dir_all(&victim).unwrap();
        std::fs::write(victim.join("keep.txt"), b"k").unwrap();

        let router = ArtifactStoreRouter::new(Arc::new(LocalArtifactStore::new()))
            .with_artifact_root(StorageLocation::Local { path: root.clone() });

        for path in ["../victim", ""] {
            let location = StorageLocation::Proxied {
                path: path.to_string(),
            };
            assert!(router.delete_tree(&location).await.is_err());
        }
        let whole_root = StorageLocation::Local { path: root.clone() };
        assert!(router.delete_tree(&whole_root).await.is_err());

        assert!(other_run.join("m.pkl").exists());
        assert!(victim.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_proxied_without_root_is_rejected() {
        let router = ArtifactStoreRouter::new(Arc::new(Recording::default()));
        let location = StorageLocation::parse("mlflow-artifacts:/2/abc").unwrap();
        assert!(router.resolve(&location).is_err());
    }
}
