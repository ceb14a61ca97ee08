//! Blob placement for the vault blob store.
//!
//! This crate provides:
//! - Deterministic, sharded blob keys derived from content hashes
//! - Staging files with atomic commit to the final location
//! - A local filesystem backend

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{
    BlobStore, ByteStream, ObjectMeta, QuarantinedBlob, StagingUpload, TempLocation, blob_key,
    parse_blob_key,
};

use std::sync::Arc;
use vault_core::config::StorageConfig;

/// Create a blob store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn BlobStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path, staging_path } => {
            let backend = match staging_path {
                Some(staging) => FilesystemBackend::with_staging(path, staging).await?,
                None => FilesystemBackend::new(path).await?,
            };
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;
    use vault_core::ContentHash;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
            staging_path: None,
        };

        let store = from_config(&config).await.unwrap();
        assert!(temp.path().join("store").join("tmp").is_dir());

        let mut upload = store.stage().await.unwrap();
        upload.write(Bytes::from_static(b"hi")).await.unwrap();
        let staged = upload.finish().await.unwrap();
        let location = store
            .commit(&staged, &ContentHash::compute(b"hi"))
            .await
            .unwrap();
        assert!(store.exists(&location).await.unwrap());
    }

    #[tokio::test]
    async fn from_config_custom_staging() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
            staging_path: Some(temp.path().join("incoming")),
        };

        let store = from_config(&config).await.unwrap();
        let upload = store.stage().await.unwrap();
        assert!(
            temp.path()
                .join("incoming")
                .join(upload.temp().as_str())
                .exists()
        );
        upload.abort().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_rejects_empty_path() {
        let config = StorageConfig::Filesystem {
            path: std::path::PathBuf::new(),
            staging_path: None,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
