//! Engine test harness over a temporary directory.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vault_core::ContentHash;
use vault_core::config::EngineConfig;
use vault_engine::Engine;
use vault_metadata::{MetadataStore, SqliteStore};
use vault_storage::{BlobStore, FilesystemBackend, blob_key};

/// An engine over a file-backed SQLite store and a filesystem blob store.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Engine,
    pub metadata: Arc<dyn MetadataStore>,
    pub blobs: Arc<FilesystemBackend>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::build(config, |store| store).await
    }

    /// Build an engine whose metadata store is wrapped by `wrap`.
    pub async fn build<F>(config: EngineConfig, wrap: F) -> Self
    where
        F: FnOnce(Arc<dyn MetadataStore>) -> Arc<dyn MetadataStore>,
    {
        Self::build_with_stores(config, wrap, |blobs| blobs as Arc<dyn BlobStore>).await
    }

    /// Build an engine whose blob store is wrapped by `wrap_blobs`.
    pub async fn with_blobs<B>(wrap_blobs: B) -> Self
    where
        B: FnOnce(Arc<FilesystemBackend>) -> Arc<dyn BlobStore>,
    {
        Self::build_with_stores(EngineConfig::default(), |store| store, wrap_blobs).await
    }

    /// Build an engine with both stores wrapped.
    pub async fn build_with_stores<F, B>(config: EngineConfig, wrap: F, wrap_blobs: B) -> Self
    where
        F: FnOnce(Arc<dyn MetadataStore>) -> Arc<dyn MetadataStore>,
        B: FnOnce(Arc<FilesystemBackend>) -> Arc<dyn BlobStore>,
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = SqliteStore::new(temp_dir.path().join("metadata.db"), 5)
            .await
            .expect("Failed to open metadata store");
        let metadata = wrap(Arc::new(sqlite));
        let blobs = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("blobs"))
                .await
                .expect("Failed to create blob store"),
        );

        let engine = Engine::new(wrap_blobs(blobs.clone()), metadata.clone(), config)
            .expect("Failed to build engine");

        Self {
            engine,
            metadata,
            blobs,
            _temp_dir: temp_dir,
        }
    }

    /// Path where the blob for `data` lands once committed.
    pub fn blob_path(&self, data: &[u8]) -> PathBuf {
        self.blobs.root().join(blob_key(&ContentHash::compute(data)))
    }

    /// Number of files left in the staging directory.
    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.blobs.staging_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Files in the shard directory of `data` other than its blob.
    pub fn shard_leftovers(&self, data: &[u8]) -> Vec<String> {
        let path = self.blob_path(data);
        let Ok(entries) = std::fs::read_dir(path.parent().expect("blob path has a shard")) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| Some(name.as_str()) != path.file_name().and_then(|n| n.to_str()))
            .collect()
    }
}

/// A payload that sniffs as `image/png`.
#[allow(dead_code)]
pub fn png_bytes(tail: &[u8]) -> Vec<u8> {
    let mut data = b"\x89PNG\x0D\x0A\x1A\x0A".to_vec();
    data.extend_from_slice(tail);
    data
}
