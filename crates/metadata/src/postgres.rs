//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{PayloadRepo, ReferenceRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use uuid::Uuid;
use vault_core::config::PgSslMode;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Name of the uniqueness constraint guarding one payload per hash.
const CONTENT_HASH_CONSTRAINT: &str = "payloads_content_hash_key";

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL error code 23505 = unique_violation
fn is_content_hash_conflict(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some(CONTENT_HASH_CONSTRAINT);
    }
    false
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately, enabling better
    /// secret management (e.g., passwords via environment variables).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!(timeout_ms, "PostgreSQL statement_timeout set");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl PayloadRepo for PostgresStore {
    async fn get_by_hash(&self, content_hash: &str) -> MetadataResult<Option<PayloadRow>> {
        let row = sqlx::query_as::<_, PayloadRow>("SELECT * FROM payloads WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_payload(&self, payload_id: Uuid) -> MetadataResult<Option<PayloadRow>> {
        let row = sqlx::query_as::<_, PayloadRow>("SELECT * FROM payloads WHERE payload_id = $1")
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
            VALUES ($1, $2, $3, $4, $5, 1, $6)
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
            "INSERT INTO payload_references (reference_id, owner_id, payload_id, display_name, created_at) VALUES ($1, $2, $3, $4, $5)",
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

        // The row lock taken here orders this increment against a concurrent
        // unlink of the same payload.
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE payloads SET reference_count = reference_count + 1 WHERE payload_id = $1 RETURNING reference_count",
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
            "INSERT INTO payload_references (reference_id, owner_id, payload_id, display_name, created_at) VALUES ($1, $2, $3, $4, $5)",
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
        let (payload_count, physical_bytes, reference_count, logical_bytes): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(size_bytes), 0)::BIGINT,
                    COALESCE(SUM(reference_count), 0)::BIGINT,
                    COALESCE(SUM(size_bytes * reference_count), 0)::BIGINT
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
impl ReferenceRepo for PostgresStore {
    async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>> {
        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM payload_references WHERE reference_id = $1",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_reference_owner(&self, reference_id: Uuid) -> MetadataResult<Option<String>> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM payload_references WHERE reference_id = $1")
                .bind(reference_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner)
    }

    async fn list_references(&self, owner_id: &str) -> MetadataResult<Vec<ReferenceRow>> {
        let rows = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM payload_references WHERE owner_id = $1 ORDER BY created_at, reference_id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn unlink_and_decrement(&self, reference_id: Uuid) -> MetadataResult<UnlinkOutcome> {
        let mut tx = self.pool.begin().await?;

        let reference = sqlx::query_as::<_, ReferenceRow>(
            "DELETE FROM payload_references WHERE reference_id = $1 RETURNING *",
        )
        .bind(reference_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(reference) = reference else {
            return Err(MetadataError::NotFound(format!(
                "reference {reference_id}"
            )));
        };

        // Under READ COMMITTED a concurrent increment holding the row lock makes
        // this DELETE re-check `reference_count = 1` against the updated row.
        let deleted: Option<(String, String)> = sqlx::query_as(
            "DELETE FROM payloads WHERE payload_id = $1 AND reference_count = 1 RETURNING content_hash, location",
        )
        .bind(reference.payload_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (content_hash, location, remaining_count) = match deleted {
            Some((content_hash, location)) => (content_hash, location, 0),
            None => {
                let row: Option<(String, String, i64)> = sqlx::query_as(
                    "UPDATE payloads SET reference_count = reference_count - 1 WHERE payload_id = $1 RETURNING content_hash, location, reference_count",
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
        let (reference_count, distinct_payloads, deduped_bytes): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM payload_references WHERE owner_id = $1),
                (SELECT COUNT(DISTINCT payload_id) FROM payload_references WHERE owner_id = $1),
                (SELECT COALESCE(SUM(p.size_bytes), 0)::BIGINT FROM payloads p
                 WHERE p.payload_id IN (
                     SELECT payload_id FROM payload_references WHERE owner_id = $1
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
