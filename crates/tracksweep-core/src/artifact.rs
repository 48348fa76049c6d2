//! Artifact storage abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, PathBuf};

use crate::{Error, Result};

const GCS_SCHEME: &str = "gs://";
const PROXY_SCHEME: &str = "mlflow-artifacts:";

/// Root of a run's artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLocation {
    /// Objects under `prefix/` in a Cloud Storage bucket.
    Gcs { bucket: String, prefix: String },
    /// A directory on local disk.
    Local { path: PathBuf },
    /// Path relative to the tracking server's artifact destination.
    Proxied { path: String },
}

impl StorageLocation {
    /// Parse an artifact URI as recorded by the tracking server.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        if let Some(rest) = uri.strip_prefix(GCS_SCHEME) {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::InvalidInput(format!("missing bucket in '{}'", uri)));
            }
            let prefix = prefix.trim_matches('/');
            check_segments(uri, prefix)?;
            return Ok(StorageLocation::Gcs {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }

        if let Some(rest) = uri.strip_prefix(PROXY_SCHEME) {
            // mlflow-artifacts://host:port/path carries an authority we ignore.
            let path = match rest.strip_prefix("//") {
                Some(with_authority) => with_authority
                    .split_once('/')
                    .map(|(_, path)| path)
                    .unwrap_or(""),
                None => rest,
            };
            let path = path.trim_matches('/');
            if path.is_empty() {
                return Err(Error::InvalidInput(format!("empty artifact path in '{}'", uri)));
            }
            check_segments(uri, path)?;
            return Ok(StorageLocation::Proxied {
                path: path.to_string(),
            });
        }

        if uri.starts_with("file:") {
            // Url::parse would silently resolve dot segments.
            check_segments(uri, uri)?;
            let url = url::Url::parse(uri)
                .map_err(|e| Error::InvalidInput(format!("invalid file URI '{}': {}", uri, e)))?;
            let path = url
                .to_file_path()
                .map_err(|_| Error::InvalidInput(format!("not a local path: '{}'", uri)))?;
            return local(uri, path);
        }

        if uri.starts_with('/') {
            return local(uri, PathBuf::from(uri));
        }

        Err(Error::InvalidInput(format!(
            "unsupported artifact location '{}'",
            uri
        )))
    }

    /// Append a relative path below this location.
    ///
    /// The result always lies strictly below `self`: empty paths and `.` or
    /// `..` segments are rejected.
    pub fn join(&self, relative: &str) -> Result<Self> {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty path below '{}'",
                self
            )));
        }
        check_segments(relative, relative)?;

        Ok(match self {
            StorageLocation::Gcs { bucket, prefix } => StorageLocation::Gcs {
                bucket: bucket.clone(),
                prefix: join_key(prefix, relative),
            },
            StorageLocation::Local { path } => StorageLocation::Local {
                path: path.join(relative),
            },
            StorageLocation::Proxied { path } => StorageLocation::Proxied {
                path: join_key(path, relative),
            },
        })
    }

    /// True when `other` is this location or lies anywhere below it.
    pub fn contains(&self, other: &StorageLocation) -> bool {
        match (self, other) {
            (
                StorageLocation::Gcs { bucket, prefix },
                StorageLocation::Gcs {
                    bucket: other_bucket,
                    prefix: other_prefix,
                },
            ) => bucket == other_bucket && key_contains(prefix, other_prefix),
            (StorageLocation::Local { path }, StorageLocation::Local { path: other }) => {
                other.starts_with(path)
            }
            (StorageLocation::Proxied { path }, StorageLocation::Proxied { path: other }) => {
                key_contains(path, other)
            }
            _ => false,
        }
    }
}

fn local(uri: &str, path: PathBuf) -> Result<StorageLocation> {
    let relative = path
        .components()
        .any(|c| matches!(c, Component::CurDir | Component::ParentDir));
    if relative {
        return Err(Error::InvalidInput(format!(
            "relative segments in artifact location '{}'",
            uri
        )));
    }
    Ok(StorageLocation::Local { path })
}

/// Object keys are compared literally, so `.` and `..` would not name what
/// they appear to.
fn check_segments(uri: &str, path: &str) -> Result<()> {
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(Error::InvalidInput(format!(
            "relative segments in artifact location '{}'",
            uri
        )));
    }
    Ok(())
}

fn join_key(base: &str, relative: &str) -> String {
    if base.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", base, relative)
    }
}

fn key_contains(base: &str, key: &str) -> bool {
    base.is_empty()
        || key == base
        || key
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::Gcs { bucket, prefix } => write!(f, "gs://{}/{}", bucket, prefix),
            StorageLocation::Local { path } => write!(f, "{}", path.display()),
            StorageLocation::Proxied { path } => write!(f, "{}/{}", PROXY_SCHEME, path),
        }
    }
}

/// What happened when an artifact tree was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionOutcome {
    Deleted { objects: u64 },
    /// Nothing existed under the root.
    AlreadyAbsent,
    /// Some objects could not be removed; `remaining` is a lower bound.
    PartialFailure { remaining: u64, reason: String },
}

impl DeletionOutcome {
    /// True when no object is left under the root.
    pub fn is_complete(&self) -> bool {
        !matches!(self, DeletionOutcome::PartialFailure { .. })
    }
}

/// Trait for object storage backends holding run artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delete every object under `location`.
    ///
    /// Transient failures are reported as `DeletionOutcome::PartialFailure`.
    /// `Error::Auth` means the store itself is unusable.
    async fn delete_tree(&self, location: &StorageLocation) -> Result<DeletionOutcome>;
}
