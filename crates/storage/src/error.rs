//! Storage error types.

use thiserror::Error;

/// Blob placement and staging errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Map a `NotFound` I/O error onto [`StorageError::NotFound`] for `key`.
    pub(crate) fn from_io(err: std::io::Error, key: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

impl From<vault_core::Error> for StorageError {
    fn from(err: vault_core::Error) -> Self {
        match err {
            vault_core::Error::HashMismatch { expected, actual } => {
                StorageError::HashMismatch { expected, actual }
            }
            vault_core::Error::InvalidHash(msg) => StorageError::InvalidKey(msg),
            other => StorageError::Config(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
