//! Error types shared by the store, ingestion and runner layers.

use thiserror::Error;

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A unique constraint rejected a create; another writer got there first.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match err {
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            Error::NotFound => StoreError::NotFound("record".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Test runner failures.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation not supported by {runner}: {operation}")]
    Unsupported {
        runner: &'static str,
        operation: &'static str,
    },

    #[error("No credentials configured for {0}")]
    MissingCredentials(String),

    #[error("Unknown runner kind: {0}")]
    UnknownKind(String),

    #[error("Invalid runner URL {0}")]
    InvalidUrl(String),
}

/// Ingestion failures, split by how the caller should report them.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed submission; nothing was written.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The conflict retry budget ran out.
    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl IngestError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(IngestError::Store(StoreError::Conflict("dup".into())).is_conflict());
        assert!(!IngestError::Store(StoreError::Database("down".into())).is_conflict());
        assert!(!IngestError::Validation("bad".into()).is_conflict());
    }

    #[test]
    fn test_not_found_maps_from_diesel() {
        let err: StoreError = diesel::result::Error::NotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
