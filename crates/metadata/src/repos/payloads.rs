//! Unique payload repository.

use crate::error::MetadataResult;
use crate::models::{PayloadRow, PayloadStats, ReferenceRow};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for unique payload records.
#[async_trait]
pub trait PayloadRepo: Send + Sync {
    /// Get a payload by its content hash (lowercase hex).
    async fn get_by_hash(&self, content_hash: &str) -> MetadataResult<Option<PayloadRow>>;

    /// Get a payload by id.
    async fn get_payload(&self, payload_id: Uuid) -> MetadataResult<Option<PayloadRow>>;

    /// Insert a new payload together with its first reference.
    ///
    /// The payload is stored with a reference count of 1 and `first_reference`
    /// is inserted in the same transaction, so a payload is never visible
    /// without a holder.
    ///
    /// Fails with [`MetadataError::DuplicateKey`](crate::MetadataError::DuplicateKey)
    /// when a payload with the same content hash already exists; nothing is
    /// written in that case.
    async fn create_unique_payload(
        &self,
        payload: &PayloadRow,
        first_reference: &ReferenceRow,
    ) -> MetadataResult<()>;

    /// Increment the reference count of `reference.payload_id` and insert
    /// `reference`, atomically. Returns the new reference count.
    ///
    /// Fails with `NotFound` when the payload no longer exists (for example,
    /// its last reference was removed concurrently).
    async fn increment_and_link(&self, reference: &ReferenceRow) -> MetadataResult<i64>;

    /// Aggregate statistics across all payloads.
    async fn get_stats(&self) -> MetadataResult<PayloadStats>;
}
