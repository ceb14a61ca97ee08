//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for blobs (`<root>/<shard>/<hash>`).
        path: PathBuf,
        /// Directory for in-flight uploads. Defaults to `<root>/tmp`.
        /// Placing it on another device forces the copy-based commit path.
        #[serde(default)]
        staging_path: Option<PathBuf>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
            staging_path: None,
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path, staging_path } => {
                if path.as_os_str().is_empty() {
                    return Err("storage path must not be empty".to_string());
                }
                if let Some(staging) = staging_path
                    && staging.as_os_str().is_empty()
                {
                    return Err("storage staging_path must not be empty when set".to_string());
                }
                Ok(())
            }
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single node deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a writer waits on a locked database before failing.
        #[serde(default = "default_sqlite_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer VAULT_METADATA__PASSWORD over storing it in a file.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_sqlite_busy_timeout_secs() -> u64 {
    5
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            busy_timeout_secs: default_sqlite_busy_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Upload and lifecycle tuning for the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bytes inspected for media type sniffing.
    #[serde(default = "default_sniff_len")]
    pub sniff_len: usize,
    /// Buffer size used while streaming a payload to staging.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    /// Optional hard cap on a single payload, in bytes.
    #[serde(default)]
    pub max_payload_bytes: Option<u64>,
    /// How many times an upload re-resolves its payload when it races a
    /// concurrent delete of the same content.
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,
    /// Age after which abandoned staging files may be swept.
    #[serde(default = "default_staging_max_age_secs")]
    pub staging_max_age_secs: u64,
}

fn default_sniff_len() -> usize {
    crate::DEFAULT_SNIFF_LEN
}

fn default_stream_buffer_size() -> usize {
    crate::DEFAULT_STREAM_BUFFER_SIZE
}

fn default_create_retries() -> u32 {
    3
}

fn default_staging_max_age_secs() -> u64 {
    86400 // 24 hours
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sniff_len: default_sniff_len(),
            stream_buffer_size: default_stream_buffer_size(),
            max_payload_bytes: None,
            create_retries: default_create_retries(),
            staging_max_age_secs: default_staging_max_age_secs(),
        }
    }
}

impl EngineConfig {
    /// Age after which abandoned staging files may be swept.
    pub fn staging_max_age(&self) -> Duration {
        Duration::from_secs(self.staging_max_age_secs)
    }

    /// Validate engine configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.sniff_len == 0 || self.sniff_len > crate::DEFAULT_SNIFF_LEN {
            return Err(format!(
                "engine.sniff_len {} must be between 1 and {}",
                self.sniff_len,
                crate::DEFAULT_SNIFF_LEN
            ));
        }
        if !(crate::MIN_STREAM_BUFFER_SIZE..=crate::MAX_STREAM_BUFFER_SIZE)
            .contains(&self.stream_buffer_size)
        {
            return Err(format!(
                "engine.stream_buffer_size {} must be between {} and {}",
                self.stream_buffer_size,
                crate::MIN_STREAM_BUFFER_SIZE,
                crate::MAX_STREAM_BUFFER_SIZE
            ));
        }
        if self.create_retries == 0 {
            return Err("engine.create_retries must be at least 1".to_string());
        }
        if self.max_payload_bytes == Some(0) {
            return Err("engine.max_payload_bytes must be positive when set".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Validate every section, prefixing errors with the section name.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage
            .validate()
            .map_err(|e| crate::Error::Config(format!("storage: {e}")))?;
        self.metadata
            .validate()
            .map_err(|e| crate::Error::Config(format!("metadata: {e}")))?;
        self.engine
            .validate()
            .map_err(|e| crate::Error::Config(format!("engine: {e}")))?;
        Ok(())
    }
}
