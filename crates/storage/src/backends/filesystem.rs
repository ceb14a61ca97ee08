//! Local filesystem storage backend.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<shard>/<hex>                     committed blobs
//! <root>/<shard>/<hex>.quarantine.<uuid>     blobs pending deletion
//! <staging>/upload-<uuid>                    in-flight uploads (defaults to <root>/tmp)
//! ```

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BlobStore, ByteStream, ObjectMeta, QuarantinedBlob, STAGING_PREFIX, StagingUpload,
    TempLocation, blob_key, parse_blob_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use vault_core::ContentHash;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Name of the default staging directory under the root.
const DEFAULT_STAGING_DIR: &str = "tmp";

/// Local filesystem blob store.
pub struct FilesystemBackend {
    root: PathBuf,
    staging: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend staging under `<root>/tmp`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(DEFAULT_STAGING_DIR);
        Self::with_staging(root, staging).await
    }

    /// Create a new filesystem backend with an explicit staging directory.
    pub async fn with_staging(
        root: impl AsRef<Path>,
        staging: impl AsRef<Path>,
    ) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = staging.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(&staging).await?;
        Ok(Self { root, staging })
    }

    /// Root directory of committed blobs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding staging files.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Full path for a blob key. Only well-formed blob keys resolve, so a key
    /// can never name anything outside its shard directory.
    fn blob_path(&self, location: &str) -> StorageResult<PathBuf> {
        parse_blob_key(location)?;
        Ok(self.root.join(location))
    }

    fn quarantine_path(&self, blob: &QuarantinedBlob) -> StorageResult<PathBuf> {
        let path = self.blob_path(blob.location())?;
        let name = format!(
            "{}.quarantine.{}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            blob.token()
        );
        Ok(path.with_file_name(name))
    }

    fn staging_path(&self, temp: &TempLocation) -> PathBuf {
        self.staging.join(temp.as_str())
    }

    /// Sibling temp name next to `path`, on the same device as the destination.
    fn sibling_temp(path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        )
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn remove_sibling(sibling: &Path) {
        if let Err(err) = fs::remove_file(sibling).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                path = %sibling.display(),
                error = %err,
                "Failed to remove sibling temp file"
            );
        }
    }

    /// Hard-link the staging file to a sibling temp at the destination and
    /// rename that into place. The staging file keeps its own link.
    async fn link_into_place(source: &Path, dest: &Path) -> std::io::Result<()> {
        let sibling = Self::sibling_temp(dest);
        fs::hard_link(source, &sibling).await?;
        if let Err(err) = fs::rename(&sibling, dest).await {
            Self::remove_sibling(&sibling).await;
            return Err(err);
        }
        Ok(())
    }

    /// Commit path for when the staging area and the destination are on
    /// different devices: copy into a sibling temp at the destination while
    /// re-hashing, fsync, verify, then rename into place. The source stays.
    async fn commit_by_copy(
        &self,
        source: &Path,
        dest: &Path,
        hash: &ContentHash,
    ) -> StorageResult<()> {
        let sibling = Self::sibling_temp(dest);
        let result = Self::copy_verified(source, &sibling, hash).await;
        if let Err(err) = result {
            Self::remove_sibling(&sibling).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&sibling, dest).await {
            Self::remove_sibling(&sibling).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn copy_verified(source: &Path, dest: &Path, hash: &ContentHash) -> StorageResult<()> {
        let mut reader = fs::File::open(source).await?;
        let mut writer = fs::File::create(dest).await?;
        let mut hasher = ContentHash::hasher();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
        }
        writer.sync_all().await?;
        hasher.finalize().verify(hash)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn stage(&self) -> StorageResult<Box<dyn StagingUpload>> {
        let temp = TempLocation::generate();
        let path = self.staging_path(&temp);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp,
            path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem", content_hash = %hash))]
    async fn commit(&self, temp: &TempLocation, hash: &ContentHash) -> StorageResult<String> {
        let source = self.staging_path(temp);
        let key = blob_key(hash);
        let dest = self.root.join(&key);
        self.ensure_parent(&dest).await?;

        match Self::link_into_place(&source, &dest).await {
            Ok(()) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::CrossesDevices | std::io::ErrorKind::Unsupported
                ) =>
            {
                debug!(error = %err, "Cannot link staging file into place, committing by copy");
                self.commit_by_copy(&source, &dest, hash).await?;
            }
            Err(err) => return Err(StorageError::from_io(err, temp.as_str())),
        }

        Ok(key)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn discard(&self, temp: &TempLocation) -> StorageResult<()> {
        match fs::remove_file(self.staging_path(temp)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, location: &str) -> StorageResult<bool> {
        let path = self.blob_path(location)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, location: &str) -> StorageResult<ObjectMeta> {
        let path = self.blob_path(location)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(e, location))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, location: &str) -> StorageResult<Bytes> {
        let path = self.blob_path(location)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(e, location))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn open(&self, location: &str) -> StorageResult<ByteStream> {
        let path = self.blob_path(location)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(e, location))?;

        // Stream the file in chunks instead of loading entirely into memory
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn remove(&self, location: &str) -> StorageResult<()> {
        let path = self.blob_path(location)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::from_io(e, location))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn quarantine(&self, location: &str) -> StorageResult<QuarantinedBlob> {
        let path = self.blob_path(location)?;
        let blob = QuarantinedBlob::new(location);
        fs::rename(&path, self.quarantine_path(&blob)?)
            .await
            .map_err(|e| StorageError::from_io(e, location))?;
        Ok(blob)
    }

    #[instrument(skip(self), fields(backend = "filesystem", location = blob.location()))]
    async fn restore(&self, blob: &QuarantinedBlob) -> StorageResult<()> {
        let dest = self.blob_path(blob.location())?;
        fs::rename(self.quarantine_path(blob)?, &dest)
            .await
            .map_err(|e| StorageError::from_io(e, blob.location()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem", location = blob.location()))]
    async fn purge(&self, blob: &QuarantinedBlob) -> StorageResult<()> {
        match fs::remove_file(self.quarantine_path(blob)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn sweep_staging(&self, older_than: Duration) -> StorageResult<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0u64;

        let mut entries = fs::read_dir(&self.staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            // Ignore directories and symlinks
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if modified > cutoff {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                // Committed or discarded concurrently
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        debug!(removed, "Swept staging area");
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        for dir in [&self.root, &self.staging] {
            let metadata = fs::metadata(dir).await.map_err(|e| {
                StorageError::Io(std::io::Error::new(
                    e.kind(),
                    format!("storage directory not accessible: {e}"),
                ))
            })?;

            if !metadata.is_dir() {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    format!("not a directory: {}", dir.display()),
                )));
            }
        }

        Ok(())
    }
}

/// Staging upload for filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp: TempLocation,
    path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StagingUpload for FilesystemUpload {
    fn temp(&self) -> &TempLocation {
        &self.temp
    }

    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<TempLocation> {
        // Ensure all data is flushed to disk before the file can be committed
        self.file.sync_all().await?;
        debug!(
            temp = %self.temp,
            bytes = self.bytes_written,
            "Staging file complete"
        );
        Ok(self.temp)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        if let Err(err) = fs::remove_file(&self.path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                temp = %self.temp,
                error = %err,
                "Failed to remove aborted staging file"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn stage_bytes(backend: &FilesystemBackend, data: &[u8]) -> TempLocation {
        let mut upload = backend.stage().await.unwrap();
        upload.write(Bytes::copy_from_slice(data)).await.unwrap();
        upload.finish().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_places_blob_under_shard() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"hello world";
        let hash = ContentHash::compute(data);
        let temp = stage_bytes(&backend, data).await;

        let location = backend.commit(&temp, &hash).await.unwrap();
        assert_eq!(location, format!("b9/{}", hash.to_hex()));
        assert!(dir.path().join(&location).is_file());
        // Staging file is kept until the caller discards it
        assert!(dir.path().join("tmp").join(temp.as_str()).exists());

        assert_eq!(backend.read(&location).await.unwrap(), Bytes::from_static(data));
        assert_eq!(backend.head(&location).await.unwrap().size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_commit_same_hash_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"same bytes";
        let hash = ContentHash::compute(data);
        let first = stage_bytes(&backend, data).await;
        let second = stage_bytes(&backend, data).await;

        let a = backend.commit(&first, &hash).await.unwrap();
        let b = backend.commit(&second, &hash).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.read(&a).await.unwrap(), Bytes::from_static(data));
    }

    #[tokio::test]
    async fn test_commit_by_copy_verifies_and_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"copied across devices";
        let hash = ContentHash::compute(data);
        let temp = stage_bytes(&backend, data).await;
        let source = backend.staging_path(&temp);
        let dest = dir.path().join(blob_key(&hash));
        backend.ensure_parent(&dest).await.unwrap();

        backend.commit_by_copy(&source, &dest, &hash).await.unwrap();
        assert!(source.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        // No sibling temp files left behind in the shard directory
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_commit_by_copy_rejects_wrong_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let temp = stage_bytes(&backend, b"actual content").await;
        let claimed = ContentHash::compute(b"something else");
        let source = backend.staging_path(&temp);
        let dest = dir.path().join(blob_key(&claimed));
        backend.ensure_parent(&dest).await.unwrap();

        let result = backend.commit_by_copy(&source, &dest, &claimed).await;
        assert!(matches!(result, Err(StorageError::HashMismatch { .. })));
        assert!(!dest.exists(), "final path must never hold unverified bytes");
        assert!(source.exists(), "staging file stays for inspection");
    }

    #[tokio::test]
    async fn test_recommit_after_final_blob_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"placed twice";
        let hash = ContentHash::compute(data);
        let temp = stage_bytes(&backend, data).await;

        let location = backend.commit(&temp, &hash).await.unwrap();
        backend.remove(&location).await.unwrap();
        assert!(!backend.exists(&location).await.unwrap());

        assert_eq!(backend.commit(&temp, &hash).await.unwrap(), location);
        assert_eq!(backend.read(&location).await.unwrap(), Bytes::from_static(data));

        backend.discard(&temp).await.unwrap();
        assert!(matches!(
            backend.commit(&temp, &hash).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_quarantine_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"set aside";
        let hash = ContentHash::compute(data);
        let temp = stage_bytes(&backend, data).await;
        let location = backend.commit(&temp, &hash).await.unwrap();

        let held = backend.quarantine(&location).await.unwrap();
        assert_eq!(held.location(), location);
        assert!(!backend.exists(&location).await.unwrap());
        assert!(backend.quarantine_path(&held).unwrap().is_file());

        backend.restore(&held).await.unwrap();
        assert_eq!(backend.read(&location).await.unwrap(), Bytes::from_static(data));
        assert!(!backend.quarantine_path(&held).unwrap().exists());
    }

    #[tokio::test]
    async fn test_restore_over_recommitted_blob() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"committed again meanwhile";
        let hash = ContentHash::compute(data);
        let temp = stage_bytes(&backend, data).await;
        let location = backend.commit(&temp, &hash).await.unwrap();

        let held = backend.quarantine(&location).await.unwrap();
        backend.commit(&temp, &hash).await.unwrap();
        backend.restore(&held).await.unwrap();
        assert_eq!(backend.read(&location).await.unwrap(), Bytes::from_static(data));
    }

    #[tokio::test]
    async fn test_quarantine_then_purge() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let data = b"going away";
        let hash = ContentHash::compute(data);
        let temp = stage_bytes(&backend, data).await;
        let location = backend.commit(&temp, &hash).await.unwrap();

        let held = backend.quarantine(&location).await.unwrap();
        backend.purge(&held).await.unwrap();
        backend.purge(&held).await.unwrap();
        assert!(!backend.exists(&location).await.unwrap());
        assert!(!backend.quarantine_path(&held).unwrap().exists());

        assert!(matches!(
            backend.quarantine(&location).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_removes_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let mut upload = backend.stage().await.unwrap();
        let path = backend.staging_path(upload.temp());
        upload.write(Bytes::from_static(b"partial")).await.unwrap();
        assert!(path.exists());

        upload.abort().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let temp = stage_bytes(&backend, b"discard me").await;
        backend.discard(&temp).await.unwrap();
        backend.discard(&temp).await.unwrap();
        assert!(!backend.staging_path(&temp).exists());
    }

    #[tokio::test]
    async fn test_remove_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let key = blob_key(&ContentHash::compute(b"never stored"));
        assert!(matches!(
            backend.remove(&key).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_locations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(backend.exists("../escape").await.is_err());
        assert!(backend.read("/etc/passwd").await.is_err());
        assert!(backend.remove("tmp/upload-x").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_staging_respects_age() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let temp = stage_bytes(&backend, b"abandoned").await;
        std::fs::write(backend.staging_dir().join("unrelated"), b"keep").unwrap();

        assert_eq!(
            backend.sweep_staging(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        assert_eq!(backend.sweep_staging(Duration::ZERO).await.unwrap(), 1);
        assert!(!backend.staging_path(&temp).exists());
        assert!(backend.staging_dir().join("unrelated").exists());
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.health_check().await.unwrap();

        std::fs::remove_dir(backend.staging_dir()).unwrap();
        assert!(backend.health_check().await.is_err());
    }
}
