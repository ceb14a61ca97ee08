//! The engine facade: upload and delete pipelines plus read-side queries.

use crate::dedup::{DedupCoordinator, Resolution};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::references::{NewReference, ReferenceManager, RemovalOutcome};
use crate::stream::{StagedBlob, stage_stream};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use vault_core::config::EngineConfig;
use vault_core::{ContentHash, MediaType};
use vault_metadata::{MetadataStore, OwnerUsage, PayloadRepo, PayloadRow, ReferenceRepo, ReferenceRow};
use vault_storage::{BlobStore, ByteStream};

/// Result of an upload or registration.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub reference: ReferenceRow,
    /// The payload, with its reference count as of this operation.
    pub payload: PayloadRow,
    /// Whether the content was already stored.
    pub deduplicated: bool,
}

/// A reference together with the payload it points at.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceView {
    pub reference: ReferenceRow,
    pub payload: PayloadRow,
}

/// One item of a batch upload.
pub struct UploadItem<R> {
    pub display_name: String,
    pub declared_media_type: Option<String>,
    pub body: R,
}

/// Storage-wide figures.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub payload_count: i64,
    pub physical_bytes: i64,
    pub reference_count: i64,
    pub logical_bytes: i64,
    pub saved_bytes: i64,
}

/// Content-addressed, reference-counted blob store.
pub struct Engine {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    config: EngineConfig,
    dedup: DedupCoordinator,
    references: ReferenceManager,
}

impl Engine {
    /// Build an engine over the given stores.
    ///
    /// Fails with `InvalidInput` when `config` does not validate.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::InvalidInput)?;
        metrics::register_metrics();
        let dedup = DedupCoordinator::new(metadata.clone(), blobs.clone(), config.create_retries);
        let references = ReferenceManager::new(metadata.clone(), blobs.clone());
        Ok(Self {
            blobs,
            metadata,
            config,
            dedup,
            references,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Upload one payload and create a reference to it for `owner_id`.
    ///
    /// Identical content is stored once; each upload still gets its own
    /// reference. A declared media type, when given, must match the content.
    #[instrument(skip(self, body), fields(owner_id = %owner_id))]
    pub async fn upload<R>(
        &self,
        owner_id: &str,
        display_name: &str,
        declared_media_type: Option<&str>,
        body: R,
    ) -> EngineResult<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let holder = NewReference::new(owner_id, display_name)?;
        let declared = declared_media_type
            .map(MediaType::parse)
            .transpose()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let mut staged = match stage_stream(&*self.blobs, &self.config, declared.as_ref(), body)
            .await
        {
            Ok(staged) => staged,
            Err(err @ EngineError::MediaTypeMismatch { .. }) => {
                metrics::MEDIA_TYPE_REJECTIONS.inc();
                warn!(error = %err, "Upload rejected");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let result = self.link_staged(&mut staged, &holder).await;

        // A failed commit leaves its staging file for inspection
        if !matches!(result, Err(EngineError::StorageWrite(_))) {
            self.discard_staged(&staged).await;
        }

        let outcome = result?;
        metrics::UPLOADS_COMPLETED.inc();
        metrics::UPLOAD_BYTES.inc_by(staged.size);
        metrics::UPLOAD_DURATION.observe(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Upload several payloads for one owner.
    ///
    /// Items are processed in order and independently: a failed item does not
    /// undo earlier ones or stop later ones.
    pub async fn upload_many<R>(
        &self,
        owner_id: &str,
        items: Vec<UploadItem<R>>,
    ) -> Vec<EngineResult<UploadOutcome>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = self
                .upload(
                    owner_id,
                    &item.display_name,
                    item.declared_media_type.as_deref(),
                    item.body,
                )
                .await;
            if let Err(err) = &result {
                debug!(display_name = %item.display_name, error = %err, "Batch item failed");
            }
            results.push(result);
        }
        results
    }

    /// Create a reference to already stored content without sending bytes.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn register_by_hash(
        &self,
        owner_id: &str,
        display_name: &str,
        content_hash: &str,
    ) -> EngineResult<UploadOutcome> {
        let holder = NewReference::new(owner_id, display_name)?;
        let hash = ContentHash::from_hex(content_hash)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let mut payload = self
            .metadata
            .get_by_hash(&hash.to_hex())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payload {hash}")))?;

        let (reference, count) = self
            .references
            .create_reference(payload.payload_id, &holder)
            .await?;
        payload.reference_count = count;
        metrics::DEDUP_HITS.inc();

        Ok(UploadOutcome {
            reference,
            payload,
            deduplicated: true,
        })
    }

    /// Owner of a reference, for the caller's authorization check.
    pub async fn get_reference_owner(&self, reference_id: Uuid) -> EngineResult<String> {
        self.references.reference_owner(reference_id).await
    }

    /// Remove a reference on behalf of `caller_id`, who must own it.
    #[instrument(skip(self), fields(caller_id = %caller_id))]
    pub async fn remove_reference(
        &self,
        reference_id: Uuid,
        caller_id: &str,
    ) -> EngineResult<RemovalOutcome> {
        let owner = self.references.reference_owner(reference_id).await?;
        if owner != caller_id {
            return Err(EngineError::Forbidden(format!(
                "reference {reference_id} is not owned by {caller_id}"
            )));
        }
        self.references.remove_reference(reference_id).await
    }

    /// A reference and its payload.
    pub async fn get_reference(&self, reference_id: Uuid) -> EngineResult<ReferenceView> {
        let reference = self
            .metadata
            .get_reference(reference_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("reference {reference_id}")))?;
        let payload = self
            .metadata
            .get_payload(reference.payload_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payload {}", reference.payload_id)))?;
        Ok(ReferenceView { reference, payload })
    }

    /// Payload for a content hash, if stored.
    pub async fn get_by_hash(&self, content_hash: &str) -> EngineResult<Option<PayloadRow>> {
        let hash = ContentHash::from_hex(content_hash)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        Ok(self.metadata.get_by_hash(&hash.to_hex()).await?)
    }

    /// Read a whole blob by location.
    pub async fn read_blob(&self, location: &str) -> EngineResult<Bytes> {
        self.blobs
            .read(location)
            .await
            .map_err(EngineError::from_blob_read)
    }

    /// Stream a blob by location.
    pub async fn open_blob(&self, location: &str) -> EngineResult<ByteStream> {
        self.blobs
            .open(location)
            .await
            .map_err(EngineError::from_blob_read)
    }

    /// Stream the content behind a reference.
    pub async fn open(&self, reference_id: Uuid) -> EngineResult<(ReferenceView, ByteStream)> {
        let view = self.get_reference(reference_id).await?;
        let stream = self.open_blob(&view.payload.location).await?;
        Ok((view, stream))
    }

    /// References held by an owner, oldest first.
    pub async fn list_references(&self, owner_id: &str) -> EngineResult<Vec<ReferenceRow>> {
        Ok(self.metadata.list_references(owner_id).await?)
    }

    /// Storage-wide dedup statistics.
    pub async fn stats(&self) -> EngineResult<StorageStats> {
        let stats = self.metadata.get_stats().await?;
        Ok(StorageStats {
            payload_count: stats.payload_count,
            physical_bytes: stats.physical_bytes,
            reference_count: stats.reference_count,
            logical_bytes: stats.logical_bytes,
            saved_bytes: stats.saved_bytes(),
        })
    }

    /// Usage figures for one owner.
    pub async fn owner_usage(&self, owner_id: &str) -> EngineResult<OwnerUsage> {
        Ok(self.metadata.get_owner_usage(owner_id).await?)
    }

    /// Remove staging files older than `older_than`, defaulting to the
    /// configured maximum age.
    pub async fn sweep_staging(&self, older_than: Option<Duration>) -> EngineResult<u64> {
        let older_than = older_than.unwrap_or_else(|| self.config.staging_max_age());
        self.blobs
            .sweep_staging(older_than)
            .await
            .map_err(EngineError::Storage)
    }

    /// Check both the blob store and the metadata store.
    pub async fn health_check(&self) -> EngineResult<()> {
        self.blobs
            .health_check()
            .await
            .map_err(EngineError::Storage)?;
        self.metadata.health_check().await?;
        Ok(())
    }

    /// Resolve the staged content to a payload and attach the holder's
    /// reference to it.
    async fn link_staged(
        &self,
        staged: &mut StagedBlob,
        holder: &NewReference,
    ) -> EngineResult<UploadOutcome> {
        for _ in 0..self.config.create_retries.max(1) {
            match self.dedup.find_or_create(staged, holder).await? {
                Resolution::Created { payload, reference } => {
                    return Ok(UploadOutcome {
                        reference,
                        payload,
                        deduplicated: false,
                    });
                }
                Resolution::Existing(mut payload) => {
                    match self
                        .references
                        .create_reference(payload.payload_id, holder)
                        .await
                    {
                        Ok((reference, count)) => {
                            metrics::DEDUP_HITS.inc();
                            payload.reference_count = count;
                            return Ok(UploadOutcome {
                                reference,
                                payload,
                                deduplicated: true,
                            });
                        }
                        Err(EngineError::NotFound(_)) => {
                            debug!(
                                payload_id = %payload.payload_id,
                                "Matched payload deleted concurrently, resolving again"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        Err(EngineError::Metadata(vault_metadata::MetadataError::Internal(format!(
            "could not attach a reference for {} after {} attempts",
            staged.hash,
            self.config.create_retries
        ))))
    }

    async fn discard_staged(&self, staged: &StagedBlob) {
        if let Err(err) = self.blobs.discard(&staged.temp).await {
            warn!(temp = %staged.temp, error = %err, "Failed to discard staging file");
        }
    }
}
