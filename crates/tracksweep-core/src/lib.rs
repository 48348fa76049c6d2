//! Core domain types and traits for tracksweep.
//!
//! This crate contains:
//! - Run identifiers, lifecycle states and the metadata store trait
//! - Storage locations and the artifact store trait
//! - The retention policy evaluator
//! - Credential resolution abstractions

pub mod artifact;
pub mod credentials;
pub mod error;
pub mod id;
pub mod policy;
pub mod run;

pub use artifact::{ArtifactStore, DeletionOutcome, StorageLocation};
pub use credentials::{AccessTokenSource, CredentialChain, CredentialProvider};
pub use error::{Error, Result};
pub use id::RunId;
pub use policy::{PolicySource, RetentionPolicy, is_eligible};
pub use run::{LifecycleState, Run, RunFilter, RunStore, RunTimestamp};
