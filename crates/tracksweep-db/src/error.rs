//! Database error types.

use thiserror::Error;
use tracksweep_core::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => Error::NotFound(msg),
            DbError::Database(e) => classify(e),
        }
    }
}

/// Sort sqlx failures into "try again later", "credentials" and the rest.
fn classify(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => Error::BackendUnavailable(err.to_string()),
        sqlx::Error::RowNotFound => Error::NotFound(err.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // 28xxx: invalid authorization specification
            Some(code) if code.starts_with("28") => Error::Auth(err.to_string()),
            // 08xxx: connection exception, 57P0x: server shutting down
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                Error::BackendUnavailable(err.to_string())
            }
            _ => Error::Internal(err.to_string()),
        },
        _ => Error::Internal(err.to_string()),
    }
}
