//! Artifact trees on local disk.

use async_recursion::async_recursion;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};
use tracksweep_core::{ArtifactStore, DeletionOutcome, Error, Result, StorageLocation};

/// Removes artifact directories from a filesystem the service can reach.
#[derive(Debug, Default, Clone)]
pub struct LocalArtifactStore;

impl LocalArtifactStore {
    pub fn new() -> Self {
        Self
    }
}

/// Number of non-directory entries below `path`.
#[async_recursion]
async fn count_files(path: &Path) -> std::io::Result<u64> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            count += count_files(&entry.path()).await?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

fn denied(path: &Path, e: &std::io::Error) -> Error {
    Error::Auth(format!("permission denied on '{}': {}", path.display(), e))
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn delete_tree(&self, location: &StorageLocation) -> Result<DeletionOutcome> {
        let StorageLocation::Local { path } = location else {
            return Err(Error::InvalidInput(format!(
                "not a local location: {}",
                location
            )));
        };
        if path.parent().is_none() {
            return Err(Error::InvalidInput(format!(
                "refusing to delete filesystem root '{}'",
                path.display()
            )));
        }

        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DeletionOutcome::AlreadyAbsent),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return Err(denied(path, &e)),
            Err(e) => {
                return Ok(DeletionOutcome::PartialFailure {
                    remaining: 0,
                    reason: e.to_string(),
                });
            }
        };

        if !metadata.is_dir() {
            return match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(DeletionOutcome::Deleted { objects: 1 }),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(DeletionOutcome::AlreadyAbsent),
                Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(denied(path, &e)),
                Err(e) => Ok(DeletionOutcome::PartialFailure {
                    remaining: 1,
                    reason: e.to_string(),
                }),
            };
        }

        let objects = match count_files(path).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return Err(denied(path, &e)),
            Err(e) => {
                return Ok(DeletionOutcome::PartialFailure {
                    remaining: 0,
                    reason: e.to_string(),
                });
            }
        };

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), objects, "Deleted artifacts");
                Ok(DeletionOutcome::Deleted { objects })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DeletionOutcome::Deleted { objects }),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(denied(path, &e)),
            Err(e) => {
                let remaining = count_files(path).await.unwrap_or(objects);
                warn!(path = %path.display(), remaining, error = %e, "Failed to delete artifacts");
                Ok(DeletionOutcome::PartialFailure {
                    remaining,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deletes_tree_and_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("1").join("abc").join("artifacts");
        std::fs::create_dir_all(root.join("plots")).unwrap();
        std::fs::write(root.join("model.pkl"), b"m").unwrap();
        std::fs::write(root.join("plots").join("loss.png"), b"p").unwrap();

        let location = StorageLocation::Local { path: root.clone() };
        let outcome = LocalArtifactStore::new().delete_tree(&location).await.unwrap();

        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 2 });
        assert!(!root.exists());
        assert!(dir.path().join("1").join("abc").exists());
    }

    #[tokio::test]
    async fn test_second_delete_is_already_absent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();

        let store = LocalArtifactStore::new();
        let location = StorageLocation::Local { path: root };
        assert!(store.delete_tree(&location).await.unwrap().is_complete());
        assert_eq!(
            store.delete_tree(&location).await.unwrap(),
            DeletionOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn test_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("artifact.bin");
        std::fs::write(&file, b"x").unwrap();

        let outcome = LocalArtifactStore::new()
            .delete_tree(&StorageLocation::Local { path: file.clone() })
            .await
            .unwrap();
        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 1 });
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_refuses_root() {
        let location = StorageLocation::Local { path: "/".into() };
        assert!(matches!(
            LocalArtifactStore::new().delete_tree(&location).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
