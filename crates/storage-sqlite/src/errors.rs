//! Storage error type and its mapping into the core taxonomy.

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("stored value error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StorageError> for caresync_core::Error {
    fn from(err: StorageError) -> Self {
        caresync_core::Error::Database(err.to_string())
    }
}
