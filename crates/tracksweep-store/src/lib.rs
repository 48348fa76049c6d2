//! Artifact storage backends for tracksweep.
//!
//! Provides [`tracksweep_core::ArtifactStore`] implementations:
//! - Cloud Storage (production)
//! - Local disk (development and file-backed tracking servers)
//!
//! plus the router that picks one per artifact URI and the Google Cloud
//! credential strategies the Cloud Storage backend authenticates with.

pub mod gcp_auth;
pub mod gcs;
pub mod local;
pub mod router;

pub use gcp_auth::{
    AmbientProvider, CredentialsFileProvider, GoogleTokenSource, SecretManagerProvider,
    ServiceAccountFieldsProvider,
};
pub use gcs::GcsArtifactStore;
pub use local::LocalArtifactStore;
pub use router::ArtifactStoreRouter;
