//! Error types for tracksweep.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// The metadata store could not be reached (transport, pool, TLS).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The object store failed in a way that may succeed on retry.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Credentials were rejected, or none could be resolved.
    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
