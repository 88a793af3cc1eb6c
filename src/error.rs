//! Error types
//!
//! `StoreError` is what a document store driver reports. `DbError` is the
//! taxonomy the dispatcher, object store and monitor work with; every
//! variant is turned into a failure envelope at the boundary.

use thiserror::Error;

/// Failures reported by a document store driver
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the connection
    #[error("connection error: {0}")]
    Connection(String),

    /// Generic driver failure
    #[error("backend error: {0}")]
    Backend(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("unsupported store uri: {0}")]
    UnsupportedUri(String),
}

impl StoreError {
    /// Whether repeating the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Backend(_) | StoreError::Sqlite(_)
        )
    }
}

/// Failures surfaced by the engine
#[derive(Debug, Error)]
pub enum DbError {
    /// Store location missing or malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("Database connection unavailable")]
    ConnectionUnavailable,

    #[error("Collection name is required")]
    MissingCollection,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Record not found")]
    NotFound,

    #[error("No chunks found for object {0}")]
    ChunksMissing(String),

    #[error("Invalid data reconstructed: {0}")]
    Integrity(String),

    #[error("Operation failed after {attempts} attempts: {source}")]
    OperationFailed {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DbError {
    /// Only transient driver failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
