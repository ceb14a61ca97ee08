//! A blob store wrapper that fails chosen operations on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use vault_core::ContentHash;
use vault_storage::{
    BlobStore, ByteStream, FilesystemBackend, ObjectMeta, QuarantinedBlob, StagingUpload,
    StorageError, StorageResult, TempLocation,
};

fn injected(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::other(format!("injected {what} failure")))
}

/// Delegates to a filesystem backend; each flag makes the matching operation
/// fail with an I/O error while it is set.
#[derive(Default)]
pub struct Faults {
    pub commit: AtomicBool,
    pub finish: AtomicBool,
    pub purge: AtomicBool,
}

impl Faults {
    fn tripped(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

pub struct FaultyBlobs {
    inner: Arc<FilesystemBackend>,
    pub faults: Arc<Faults>,
}

impl FaultyBlobs {
    pub fn new(inner: Arc<FilesystemBackend>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn inner(&self) -> &FilesystemBackend {
        &self.inner
    }
}

/// Staging upload whose `finish` fails after the bytes were written, leaving
/// the file behind as an interrupted sync would.
struct FailingFinish {
    inner: Box<dyn StagingUpload>,
}

#[async_trait]
impl StagingUpload for FailingFinish {
    fn temp(&self) -> &TempLocation {
        self.inner.temp()
    }

    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.inner.write(data).await
    }

    async fn finish(self: Box<Self>) -> StorageResult<TempLocation> {
        drop(self.inner);
        Err(injected("finish"))
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}

#[async_trait]
impl BlobStore for FaultyBlobs {
    async fn stage(&self) -> StorageResult<Box<dyn StagingUpload>> {
        let upload = self.inner.stage().await?;
        if Faults::tripped(&self.faults.finish) {
            return Ok(Box::new(FailingFinish { inner: upload }));
        }
        Ok(upload)
    }

    async fn commit(&self, temp: &TempLocation, hash: &ContentHash) -> StorageResult<String> {
        if Faults::tripped(&self.faults.commit) {
            return Err(injected("commit"));
        }
        self.inner.commit(temp, hash).await
    }

    async fn discard(&self, temp: &TempLocation) -> StorageResult<()> {
        self.inner.discard(temp).await
    }

    async fn exists(&self, location: &str) -> StorageResult<bool> {
        self.inner.exists(location).await
    }

    async fn head(&self, location: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(location).await
    }

    async fn read(&self, location: &str) -> StorageResult<Bytes> {
        self.inner.read(location).await
    }

    async fn open(&self, location: &str) -> StorageResult<ByteStream> {
        self.inner.open(location).await
    }

    async fn remove(&self, location: &str) -> StorageResult<()> {
        self.inner.remove(location).await
    }

    async fn quarantine(&self, location: &str) -> StorageResult<QuarantinedBlob> {
        self.inner.quarantine(location).await
    }

    async fn restore(&self, blob: &QuarantinedBlob) -> StorageResult<()> {
        self.inner.restore(blob).await
    }

    async fn purge(&self, blob: &QuarantinedBlob) -> StorageResult<()> {
        if Faults::tripped(&self.faults.purge) {
            return Err(injected("purge"));
        }
        self.inner.purge(blob).await
    }

    async fn sweep_staging(&self, older_than: Duration) -> StorageResult<u64> {
        self.inner.sweep_staging(older_than).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}
