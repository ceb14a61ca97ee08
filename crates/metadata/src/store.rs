//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{PayloadRepo, ReferenceRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: PayloadRepo + ReferenceRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Get the backend name for logging/debugging.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store. `":memory:"` opens a private in-memory database.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serialises writers instead of failing them with "database is locked".
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "Opened SQLite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// SQLite error: "UNIQUE constraint failed: payloads.content_hash"
fn is_content_hash_conflict(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        let msg = db_err.message();
        return msg.contains("UNIQUE constraint") && msg.contains("content_hash");
    }
    false
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use uuid::Uuid;

    #[async_trait]
    impl PayloadRepo for SqliteStore {
        async fn get_by_hash(&self, content_hash: &str) -> MetadataResult<Option<PayloadRow>> {
            let row =
                sqlx::query_as::<_, PayloadRow>("SELECT * FROM payloads WHERE content_hash = ?")
                    .bind(content_hash)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn get_payload(&self, payload_id: Uuid) -> MetadataResult<Option<PayloadRow>> {
            let row =
                sqlx::query_as::<_, PayloadRow>("SELECT * FROM payloads WHERE payload_id = ?")
                    .bind(payload_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn create_unique_payload(
            &self,
            payload: &PayloadRow,
            first_reference: &ReferenceRow,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO payloads (payload_id, content_hash, location, size_bytes, media_type, reference_count, created_at)
                VALUES (?, ?, ?, ?, ?, 1, ?)
                "#,
            )
            .bind(payload.payload_id)
            .bind(&payload.content_hash)
            .bind(&payload.location)
            .bind(payload.size_bytes)
            .bind(&payload.media_type)
            .bind(payload.created_at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if is_content_hash_conflict(&e) {
                    return Err(MetadataError::DuplicateKey(payload.content_hash.clone()));
                }
                return Err(e.into());
            }

            sqlx::query(
                "INSERT INTO payload_references (reference_id, owner_id, payload_id, display_name, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(first_reference.reference_id)
            .bind(&first_reference.owner_id)
            .bind(payload.payload_id)
            .bind(&first_reference.display_name)
            .bind(first_reference.created_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn increment_and_link(&self, reference: &ReferenceRow) -> MetadataResult<i64> {
            let mut tx = self.pool.begin().await?;

            let count: Option<i64> = sqlx::query_scalar(
                "UPDATE payloads SET reference_count = reference_count + 1 WHERE payload_id = ? RETURNING reference_count",
            )
            .bind(reference.payload_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(count) = count else {
                return Err(MetadataError::NotFound(format!(
                    "payload {}",
                    reference.payload_id
                )));
            };

            sqlx::query(
                "INSERT INTO payload_references (reference_id, owner_id, payload_id, display_name, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(reference.reference_id)
            .bind(&reference.owner_id)
            .bind(reference.payload_id)
            .bind(&reference.display_name)
            .bind(reference.created_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(count)
        }

        async fn get_stats(&self) -> MetadataResult<PayloadStats> {
            let (payload_count, physical_bytes, reference_count, logical_bytes): (
                i64,
                i64,
                i64,
                i64,
            ) = sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(size_bytes), 0),
                    COALESCE(SUM(reference_count), 0),
                    COALESCE(SUM(size_bytes * reference_count), 0)
                FROM payloads
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

            Ok(PayloadStats {
                payload_count,
                physical_bytes,
                reference_count,
                logical_bytes,
            })
        }
    }

    #[async_trait]
    impl ReferenceRepo for SqliteStore {
        async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>> {
            let row = sqlx::query_as::<_, ReferenceRow>(
                "SELECT * FROM payload_references WHERE reference_id = ?",
            )
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_reference_owner(&self, reference_id: Uuid) -> MetadataResult<Option<String>> {
            let owner: Option<String> = sqlx::query_scalar(
                "SELECT owner_id FROM payload_references WHERE reference_id = ?",
            )
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(owner)
        }

        async fn list_references(&self, owner_id: &str) -> MetadataResult<Vec<ReferenceRow>> {
            let rows = sqlx::query_as::<_, ReferenceRow>(
                "SELECT * FROM payload_references WHERE owner_id = ? ORDER BY created_at, rowid",
            )
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn unlink_and_decrement(&self, reference_id: Uuid) -> MetadataResult<UnlinkOutcome> {
            let mut tx = self.pool.begin().await?;

            let reference = sqlx::query_as::<_, ReferenceRow>(
                "DELETE FROM payload_references WHERE reference_id = ? RETURNING *",
            )
            .bind(reference_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(reference) = reference else {
                return Err(MetadataError::NotFound(format!(
                    "reference {reference_id}"
                )));
            };

            // Last holder: the row goes away instead of reaching zero
            let deleted: Option<(String, String)> = sqlx::query_as(
                "DELETE FROM payloads WHERE payload_id = ? AND reference_count = 1 RETURNING content_hash, location",
            )
            .bind(reference.payload_id)
            .fetch_optional(&mut *tx)
            .await?;

            let (content_hash, location, remaining_count) = match deleted {
                Some((content_hash, location)) => (content_hash, location, 0),
                None => {
                    let row: Option<(String, String, i64)> = sqlx::query_as(
                        "UPDATE payloads SET reference_count = reference_count - 1 WHERE payload_id = ? RETURNING content_hash, location, reference_count",
                    )
                    .bind(reference.payload_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                    row.ok_or_else(|| {
                        MetadataError::Internal(format!(
                            "reference {reference_id} points at missing payload {}",
                            reference.payload_id
                        ))
                    })?
                }
            };

            tx.commit().await?;

            Ok(UnlinkOutcome {
                payload_id: reference.payload_id,
                reference,
                content_hash,
                location,
                remaining_count,
            })
        }

        async fn get_owner_usage(&self, owner_id: &str) -> MetadataResult<OwnerUsage> {
            let (reference_count, distinct_payloads, deduped_bytes): (i64, i64, i64) =
                sqlx::query_as(
                    r#"
                    SELECT
                        (SELECT COUNT(*) FROM payload_references WHERE owner_id = ?1),
                        (SELECT COUNT(DISTINCT payload_id) FROM payload_references WHERE owner_id = ?1),
                        (SELECT COALESCE(SUM(p.size_bytes), 0) FROM payloads p
                         WHERE p.payload_id IN (
                             SELECT payload_id FROM payload_references WHERE owner_id = ?1
                         ))
                    "#,
                )
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;

            Ok(OwnerUsage {
                reference_count,
                distinct_payloads,
                deduped_bytes,
            })
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- One row per distinct content hash
CREATE TABLE IF NOT EXISTS payloads (
    payload_id BLOB PRIMARY KEY,
    content_hash TEXT NOT NULL UNIQUE,
    location TEXT NOT NULL,
    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
    media_type TEXT NOT NULL,
    reference_count INTEGER NOT NULL CHECK (reference_count > 0),
    created_at TEXT NOT NULL
);

-- Named handles onto payloads
CREATE TABLE IF NOT EXISTS payload_references (
    reference_id BLOB PRIMARY KEY,
    owner_id TEXT NOT NULL,
    payload_id BLOB NOT NULL REFERENCES payloads(payload_id),
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_references_owner ON payload_references(owner_id, created_at);
CREATE INDEX IF NOT EXISTS idx_references_payload ON payload_references(payload_id);
"#;
