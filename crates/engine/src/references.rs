//! Reference lifecycle: linking references to payloads and tearing them down.

use crate::error::{EngineError, EngineResult};
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vault_metadata::{MetadataStore, PayloadRepo, ReferenceRepo, ReferenceRow, UnlinkOutcome};
use vault_storage::{BlobStore, QuarantinedBlob, StorageError};

/// Who a new reference belongs to and what it is called.
#[derive(Debug, Clone)]
pub struct NewReference {
    pub owner_id: String,
    pub display_name: String,
}

impl NewReference {
    /// Validate and build a holder description.
    pub fn new(owner_id: impl Into<String>, display_name: impl Into<String>) -> EngineResult<Self> {
        let owner_id = owner_id.into();
        let display_name = display_name.into();
        if owner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("owner id must not be empty".into()));
        }
        if display_name.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "display name must not be empty".into(),
            ));
        }
        Ok(Self {
            owner_id,
            display_name,
        })
    }

    /// A fresh reference row pointing at `payload_id`.
    pub fn to_row(&self, payload_id: Uuid) -> ReferenceRow {
        ReferenceRow {
            reference_id: Uuid::new_v4(),
            owner_id: self.owner_id.clone(),
            payload_id,
            display_name: self.display_name.clone(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// What happened when a reference was removed.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalOutcome {
    pub reference_id: Uuid,
    pub payload_id: Uuid,
    /// References still pointing at the payload.
    pub remaining_count: i64,
    /// Whether the payload record was deleted with this reference.
    pub payload_deleted: bool,
    /// Whether the blob was physically removed.
    pub blob_removed: bool,
}

/// Creates and removes logical references, and drives physical deletion of
/// a payload once its last reference is gone.
pub struct ReferenceManager {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl ReferenceManager {
    pub fn new(metadata: Arc<dyn MetadataStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { metadata, blobs }
    }

    /// Link a new reference to an existing payload, incrementing its count in
    /// the same transaction. Returns the reference and the new count.
    ///
    /// Fails with `NotFound` when the payload no longer exists.
    #[instrument(skip(self, holder), fields(owner_id = %holder.owner_id))]
    pub async fn create_reference(
        &self,
        payload_id: Uuid,
        holder: &NewReference,
    ) -> EngineResult<(ReferenceRow, i64)> {
        let reference = holder.to_row(payload_id);
        let count = self
            .metadata
            .increment_and_link(&reference)
            .await
            .map_err(EngineError::from_metadata)?;

        debug!(
            reference_id = %reference.reference_id,
            reference_count = count,
            "Reference linked to existing payload"
        );
        Ok((reference, count))
    }

    /// Owner of a reference.
    pub async fn reference_owner(&self, reference_id: Uuid) -> EngineResult<String> {
        self.metadata
            .get_reference_owner(reference_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("reference {reference_id}")))
    }

    /// Remove a reference and decrement its payload.
    ///
    /// Authorization is the caller's job; see [`ReferenceManager::reference_owner`].
    /// When this was the last reference the payload record is gone once the
    /// metadata transaction commits, and the blob is removed afterwards on a
    /// best-effort basis.
    #[instrument(skip(self))]
    pub async fn remove_reference(&self, reference_id: Uuid) -> EngineResult<RemovalOutcome> {
        let outcome = self
            .metadata
            .unlink_and_decrement(reference_id)
            .await
            .map_err(EngineError::from_metadata)?;

        let mut blob_removed = false;
        if outcome.payload_deleted() {
            metrics::PAYLOADS_DELETED.inc();
            info!(
                payload_id = %outcome.payload_id,
                content_hash = %outcome.content_hash,
                "Last reference removed, payload deleted"
            );
            blob_removed = self.release_blob(&outcome).await;
        } else {
            debug!(
                payload_id = %outcome.payload_id,
                remaining = outcome.remaining_count,
                "Reference removed"
            );
        }

        Ok(RemovalOutcome {
            reference_id,
            payload_id: outcome.payload_id,
            remaining_count: outcome.remaining_count,
            payload_deleted: outcome.payload_deleted(),
            blob_removed,
        })
    }

    /// Physically remove the blob of a deleted payload. Never fails the caller:
    /// the committed metadata transaction is the authoritative outcome.
    ///
    /// The blob is moved aside before the payload is looked up again. Content
    /// uploaded again after that lookup finds its blob missing once its record
    /// exists and commits it again; content recorded before the lookup gets
    /// the quarantined blob back.
    async fn release_blob(&self, outcome: &UnlinkOutcome) -> bool {
        let held = match self.blobs.quarantine(&outcome.location).await {
            Ok(held) => held,
            Err(StorageError::NotFound(_)) => {
                debug!(location = %outcome.location, "Blob already absent");
                return false;
            }
            Err(err) => {
                metrics::BLOB_REMOVAL_FAILURES.inc();
                warn!(
                    location = %outcome.location,
                    error = %err,
                    "Failed to set aside blob of deleted payload"
                );
                return false;
            }
        };

        match self.metadata.get_by_hash(&outcome.content_hash).await {
            Ok(None) => {}
            Ok(Some(recreated)) => {
                info!(
                    content_hash = %outcome.content_hash,
                    payload_id = %recreated.payload_id,
                    "Content stored again meanwhile, keeping blob"
                );
                self.put_back(&held).await;
                return false;
            }
            Err(err) => {
                metrics::BLOB_REMOVAL_FAILURES.inc();
                warn!(
                    content_hash = %outcome.content_hash,
                    location = %outcome.location,
                    error = %err,
                    "Could not re-check payload before blob removal, keeping blob"
                );
                self.put_back(&held).await;
                return false;
            }
        }

        match self.blobs.purge(&held).await {
            Ok(()) => {
                debug!(location = %outcome.location, "Blob removed");
                true
            }
            Err(err) => {
                metrics::BLOB_REMOVAL_FAILURES.inc();
                warn!(
                    location = %outcome.location,
                    error = %err,
                    "Failed to remove blob of deleted payload"
                );
                false
            }
        }
    }

    async fn put_back(&self, held: &QuarantinedBlob) {
        if let Err(err) = self.blobs.restore(held).await {
            metrics::BLOB_REMOVAL_FAILURES.inc();
            warn!(
                location = held.location(),
                error = %err,
                "Failed to restore quarantined blob"
            );
        }
    }
}
