//! Row builders for repository tests.

use time::OffsetDateTime;
use uuid::Uuid;
use vault_core::ContentHash;
use vault_metadata::models::{PayloadRow, ReferenceRow};

/// Lowercase hex SHA-256 of a seed string.
pub fn test_hash(seed: &str) -> String {
    ContentHash::compute(seed.as_bytes()).to_hex()
}

/// A payload row for `seed` with the given size.
pub fn payload_row(seed: &str, size_bytes: i64) -> PayloadRow {
    let hash = ContentHash::compute(seed.as_bytes());
    PayloadRow {
        payload_id: Uuid::new_v4(),
        content_hash: hash.to_hex(),
        location: format!("{}/{}", hash.shard(), hash.to_hex()),
        size_bytes,
        media_type: "text/plain; charset=utf-8".to_string(),
        reference_count: 1,
        created_at: OffsetDateTime::now_utc(),
    }
}

/// A reference row owned by `owner` pointing at `payload_id`.
pub fn reference_row(owner: &str, payload_id: Uuid, name: &str) -> ReferenceRow {
    ReferenceRow {
        reference_id: Uuid::new_v4(),
        owner_id: owner.to_string(),
        payload_id,
        display_name: name.to_string(),
        created_at: OffsetDateTime::now_utc(),
    }
}
