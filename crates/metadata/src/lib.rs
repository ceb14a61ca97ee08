//! Metadata repository for the vault blob store.
//!
//! This crate tracks:
//! - Unique payloads, one per content hash, with their reference counts
//! - Logical references held by owners
//!
//! Count mutations are single short transactions: creating a payload with
//! its first reference, incrementing while linking a reference, and
//! unlinking while decrementing (deleting the payload on its last holder).

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{OwnerUsage, PayloadRow, PayloadStats, ReferenceRow, UnlinkOutcome};
pub use postgres::PostgresStore;
pub use repos::{PayloadRepo, ReferenceRepo};
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use vault_core::config::MetadataConfig;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;

    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                // URL takes precedence over individual fields
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
