//! Engine error types.

use thiserror::Error;
use vault_metadata::MetadataError;
use vault_storage::StorageError;

/// Errors surfaced by the engine to its callers.
///
/// Repository uniqueness conflicts never appear here; they are resolved
/// inside the dedup coordinator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("media type mismatch: declared {declared}, detected {sniffed}")]
    MediaTypeMismatch { declared: String, sniffed: String },

    #[error("stream I/O error: {0}")]
    StreamIo(#[source] StorageError),

    #[error("payload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage write error: {0}")]
    StorageWrite(#[source] StorageError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Stable error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MediaTypeMismatch { .. } => "media_type_mismatch",
            Self::StreamIo(_) => "stream_io",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::StorageWrite(_) => "storage_write",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    /// Map a blob read failure, keeping "not found" distinguishable.
    pub(crate) fn from_blob_read(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(location) => Self::NotFound(format!("blob {location}")),
            other => Self::Storage(other),
        }
    }

    /// Map a repository failure, keeping "not found" distinguishable.
    pub(crate) fn from_metadata(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(what) => Self::NotFound(what),
            other => Self::Metadata(other),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
