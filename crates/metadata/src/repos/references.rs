//! Logical reference repository.

use crate::error::MetadataResult;
use crate::models::{OwnerUsage, ReferenceRow, UnlinkOutcome};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for logical references.
#[async_trait]
pub trait ReferenceRepo: Send + Sync {
    /// Get a reference by id.
    async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>>;

    /// Owner of a reference, if it exists.
    async fn get_reference_owner(&self, reference_id: Uuid) -> MetadataResult<Option<String>>;

    /// All references held by an owner, oldest first.
    async fn list_references(&self, owner_id: &str) -> MetadataResult<Vec<ReferenceRow>>;

    /// Delete a reference and decrement its payload, atomically.
    ///
    /// When the decrement would reach zero the payload row is deleted in the
    /// same transaction instead, so no reader ever observes a zero count.
    /// Fails with `NotFound` if the reference does not exist.
    async fn unlink_and_decrement(&self, reference_id: Uuid) -> MetadataResult<UnlinkOutcome>;

    /// Usage figures for one owner.
    async fn get_owner_usage(&self, owner_id: &str) -> MetadataResult<OwnerUsage>;
}
