//! Database models mapping to the metadata schema.

use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// One record per distinct content hash.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PayloadRow {
    pub payload_id: Uuid,
    /// Lowercase hex SHA-256 of the payload bytes. Unique.
    pub content_hash: String,
    /// Blob key in the blob store (`<shard>/<hex>`).
    pub location: String,
    pub size_bytes: i64,
    pub media_type: String,
    /// Number of live references. Always at least 1 while the row exists.
    pub reference_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A named handle held by an owner, pointing at one payload.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReferenceRow {
    pub reference_id: Uuid,
    pub owner_id: String,
    pub payload_id: Uuid,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of removing a reference and decrementing its payload.
#[derive(Debug, Clone)]
pub struct UnlinkOutcome {
    /// The reference that was removed.
    pub reference: ReferenceRow,
    /// Payload the reference pointed at.
    pub payload_id: Uuid,
    pub content_hash: String,
    pub location: String,
    /// Count after the decrement. Zero means the payload row was deleted in
    /// the same transaction.
    pub remaining_count: i64,
}

impl UnlinkOutcome {
    /// Whether the payload record went away with this reference.
    pub fn payload_deleted(&self) -> bool {
        self.remaining_count == 0
    }
}

/// Aggregate figures across all payloads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PayloadStats {
    /// Number of unique payloads.
    pub payload_count: i64,
    /// Bytes stored once per unique payload.
    pub physical_bytes: i64,
    /// Number of live references.
    pub reference_count: i64,
    /// Bytes as seen by reference holders (size times reference count).
    pub logical_bytes: i64,
}

impl PayloadStats {
    /// Bytes not stored thanks to deduplication.
    pub fn saved_bytes(&self) -> i64 {
        self.logical_bytes - self.physical_bytes
    }
}

/// What one owner's references add up to.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OwnerUsage {
    pub reference_count: i64,
    /// Distinct payloads referenced by the owner.
    pub distinct_payloads: i64,
    /// Size of the distinct payloads; a payload referenced twice counts once.
    pub deduped_bytes: i64,
}
