//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use vault_core::ContentHash;
use vault_core::hash::{HEX_LEN, SHARD_LEN};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Prefix shared by every staging file name.
pub const STAGING_PREFIX: &str = "upload-";

/// Handle to a fully written file in the staging area.
///
/// Opaque to callers: it names a file inside the backend's staging directory
/// and is only meaningful to the backend that produced it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TempLocation(String);

impl TempLocation {
    /// Wrap a staging file name. Only names produced by [`TempLocation::generate`]
    /// are accepted back by backends.
    pub fn from_name(name: impl Into<String>) -> StorageResult<Self> {
        let name = name.into();
        if !name.starts_with(STAGING_PREFIX)
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(StorageError::InvalidKey(format!(
                "not a staging file name: {name}"
            )));
        }
        Ok(Self(name))
    }

    /// A fresh, unique staging file name.
    pub fn generate() -> Self {
        Self(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// The staging file name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TempLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TempLocation").field(&self.0).finish()
    }
}

impl fmt::Display for TempLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic blob key for a content hash: `<shard>/<hex>`.
pub fn blob_key(hash: &ContentHash) -> String {
    format!("{}/{}", hash.shard(), hash.to_hex())
}

/// Parse and validate a blob key, returning the hash it names.
///
/// Only the exact `<2 hex>/<64 hex>` shape produced by [`blob_key`] is accepted,
/// with the shard matching the hash prefix and lowercase digits throughout.
pub fn parse_blob_key(key: &str) -> StorageResult<ContentHash> {
    let invalid = || StorageError::InvalidKey(format!("not a blob key: {key}"));

    let (shard, hex) = key.split_once('/').ok_or_else(invalid)?;
    if shard.len() != SHARD_LEN || hex.len() != HEX_LEN || !hex.starts_with(shard) {
        return Err(invalid());
    }
    if hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(invalid());
    }
    ContentHash::from_hex(hex).map_err(|_| invalid())
}

/// A blob moved aside by [`BlobStore::quarantine`]. It is no longer visible at
/// its location until [`BlobStore::restore`] puts it back; [`BlobStore::purge`]
/// deletes it for good.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuarantinedBlob {
    location: String,
    token: uuid::Uuid,
}

impl QuarantinedBlob {
    pub(crate) fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            token: uuid::Uuid::new_v4(),
        }
    }

    /// The location the blob was taken from.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Distinguishes concurrent quarantines of the same location.
    pub fn token(&self) -> uuid::Uuid {
        self.token
    }
}

/// Metadata about a stored blob.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Blob size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Content-addressed blob placement.
///
/// Final locations are keys of the form `<shard>/<hex>`; writes go through a
/// uniquely named staging file and become visible at their final location only
/// through [`BlobStore::commit`].
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Open a new, uniquely named staging file.
    async fn stage(&self) -> StorageResult<Box<dyn StagingUpload>>;

    /// Place a staged file at the final location derived from `hash`.
    ///
    /// A reader of the final location sees either nothing or the complete blob.
    /// Committing over an existing blob with the same hash is harmless. The
    /// staging file is left in place, so the same bytes can be committed again
    /// until the caller discards it.
    async fn commit(&self, temp: &TempLocation, hash: &ContentHash) -> StorageResult<String>;

    /// Remove a staging file. Missing files are not an error.
    async fn discard(&self, temp: &TempLocation) -> StorageResult<()>;

    /// Check if a blob exists at `location`.
    async fn exists(&self, location: &str) -> StorageResult<bool>;

    /// Get blob metadata.
    async fn head(&self, location: &str) -> StorageResult<ObjectMeta>;

    /// Read a whole blob into memory.
    async fn read(&self, location: &str) -> StorageResult<Bytes>;

    /// Stream a blob in fixed-size chunks.
    async fn open(&self, location: &str) -> StorageResult<ByteStream>;

    /// Delete a blob.
    async fn remove(&self, location: &str) -> StorageResult<()>;

    /// Move the blob at `location` aside. Fails with `NotFound` when there is
    /// no blob there.
    async fn quarantine(&self, location: &str) -> StorageResult<QuarantinedBlob>;

    /// Put a quarantined blob back at its location, replacing whatever was
    /// committed there meanwhile (same hash, so the same bytes).
    async fn restore(&self, blob: &QuarantinedBlob) -> StorageResult<()>;

    /// Delete a quarantined blob. Missing files are not an error.
    async fn purge(&self, blob: &QuarantinedBlob) -> StorageResult<()>;

    /// Delete staging files last modified more than `older_than` ago.
    /// Returns the number of files removed.
    async fn sweep_staging(&self, older_than: Duration) -> StorageResult<u64>;

    /// Get the backend name for logging/debugging.
    fn backend_name(&self) -> &'static str;

    /// Check the health of the storage backend.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// A staging file being written.
#[async_trait]
pub trait StagingUpload: Send {
    /// The staging file this upload writes to.
    fn temp(&self) -> &TempLocation;

    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Flush the file to durable storage and hand back its location.
    async fn finish(self: Box<Self>) -> StorageResult<TempLocation>;

    /// Abort the upload and remove the staging file.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
