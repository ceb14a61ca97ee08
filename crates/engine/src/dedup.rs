//! Find-or-create of unique payloads by content hash.
//!
//! Creation is an optimistic insert guarded by the repository's uniqueness
//! constraint on the content hash. A creator that loses the race sees
//! `DuplicateKey` and falls back to reading the winner's record.
//!
//! The staged file outlives the commit, so a creator whose blob was taken by
//! a concurrent deletion can put the bytes back once its record exists.

use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::references::NewReference;
use crate::stream::StagedBlob;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vault_metadata::{MetadataError, MetadataStore, PayloadRepo, PayloadRow, ReferenceRow};
use vault_storage::{BlobStore, StorageError};

/// Outcome of [`DedupCoordinator::find_or_create`].
#[derive(Debug)]
pub enum Resolution {
    /// A payload with this hash already exists. No count was changed; the
    /// caller links its own reference.
    Existing(PayloadRow),
    /// This call created the payload, with `reference` as its first holder.
    Created {
        payload: PayloadRow,
        reference: ReferenceRow,
    },
}

/// Resolves staged content to its unique payload record.
pub struct DedupCoordinator {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    max_attempts: u32,
}

impl DedupCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        max_attempts: u32,
    ) -> Self {
        Self {
            metadata,
            blobs,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Find the payload for `staged`, or commit its bytes and create it.
    ///
    /// On a hit the blob store is not touched. On a miss the staged file is
    /// committed to its final location and the payload is created with
    /// `holder` as its first reference; the blob is checked again after the
    /// record is written. The staging file is left for the caller to discard.
    #[instrument(skip(self, staged, holder), fields(content_hash = %staged.hash))]
    pub async fn find_or_create(
        &self,
        staged: &mut StagedBlob,
        holder: &NewReference,
    ) -> EngineResult<Resolution> {
        let content_hash = staged.hash.to_hex();

        for attempt in 1..=self.max_attempts {
            if let Some(existing) = self.metadata.get_by_hash(&content_hash).await? {
                debug!(payload_id = %existing.payload_id, attempt, "Content already stored");
                return Ok(Resolution::Existing(existing));
            }

            let location = self.commit(staged).await?;
            let payload = PayloadRow {
                payload_id: Uuid::new_v4(),
                content_hash: content_hash.clone(),
                location,
                size_bytes: i64::try_from(staged.size).map_err(|_| {
                    EngineError::InvalidInput(format!("payload size {} out of range", staged.size))
                })?,
                media_type: staged.media_type.as_str().to_string(),
                reference_count: 1,
                created_at: OffsetDateTime::now_utc(),
            };
            let reference = holder.to_row(payload.payload_id);

            match self
                .metadata
                .create_unique_payload(&payload, &reference)
                .await
            {
                Ok(()) => {
                    self.ensure_placed(staged, &payload.location).await?;
                    metrics::PAYLOADS_CREATED.inc();
                    info!(
                        payload_id = %payload.payload_id,
                        size = payload.size_bytes,
                        media_type = %payload.media_type,
                        "Payload created"
                    );
                    return Ok(Resolution::Created { payload, reference });
                }
                Err(MetadataError::DuplicateKey(_)) => {
                    // The winner's bytes sit at the same final path as ours
                    metrics::CREATE_CONFLICTS.inc();
                    debug!(attempt, "Lost payload creation race, re-reading winner");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(EngineError::Metadata(MetadataError::Internal(format!(
            "payload {content_hash} unresolved after {} attempts",
            self.max_attempts
        ))))
    }

    /// Commit the staged file. Committing the same bytes again is harmless.
    async fn commit(&self, staged: &mut StagedBlob) -> EngineResult<String> {
        let location = self
            .blobs
            .commit(&staged.temp, &staged.hash)
            .await
            .map_err(EngineError::StorageWrite)?;
        debug!(location = %location, "Blob committed");
        staged.location = Some(location.clone());
        Ok(location)
    }

    /// A deletion of an earlier payload with this hash may have taken the blob
    /// between our commit and our insert. Its re-check ran before the insert,
    /// so it will not come back for it; commit again from staging.
    async fn ensure_placed(&self, staged: &mut StagedBlob, location: &str) -> EngineResult<()> {
        let present = self
            .blobs
            .exists(location)
            .await
            .map_err(EngineError::StorageWrite)?;
        if present {
            return Ok(());
        }

        warn!(location, "Blob removed by a concurrent deletion, committing again");
        metrics::BLOB_RECOMMITS.inc();
        let recommitted = self.commit(staged).await?;
        if recommitted != location {
            return Err(EngineError::StorageWrite(StorageError::InvalidKey(format!(
                "blob committed to {recommitted}, expected {location}"
            ))));
        }
        Ok(())
    }
}
