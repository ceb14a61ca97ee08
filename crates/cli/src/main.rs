//! Command line front end for the vault blob store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vault_core::config::AppConfig;
use vault_engine::{Engine, EngineError, UploadItem};

/// Vault - a deduplicating content-addressed blob store
#[derive(Parser, Debug)]
#[command(name = "vault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "VAULT_CONFIG",
        default_value = "config/vault.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload one or more files, deduplicating identical content
    Put {
        /// Files to upload; `-` reads a single payload from stdin
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Owner of the new references
        #[arg(long)]
        owner: String,
        /// Display name (single file only; defaults to the file name)
        #[arg(long)]
        name: Option<String>,
        /// Declared media type, checked against the content
        #[arg(long)]
        media_type: Option<String>,
    },
    /// Reference already stored content by its hash
    Register {
        /// Hex SHA-256 of the content
        hash: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
    },
    /// Remove a reference, deleting the payload with its last reference
    Rm {
        reference_id: Uuid,
        /// Caller; must own the reference
        #[arg(long)]
        owner: String,
    },
    /// Show a reference and its payload
    Show { reference_id: Uuid },
    /// Write the content behind a reference to stdout or a file
    Cat {
        reference_id: Uuid,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List an owner's references, oldest first
    Ls {
        #[arg(long)]
        owner: String,
    },
    /// Storage statistics
    Stats {
        /// Report usage for one owner instead
        #[arg(long)]
        owner: Option<String>,
        /// Print the Prometheus text exposition
        #[arg(long, default_value_t = false)]
        metrics: bool,
    },
    /// Remove abandoned staging files
    SweepTmp {
        /// Minimum age in seconds (default: engine.staging_max_age_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Check the blob store and metadata store
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `cat` output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(Path::new(&cli.config))?;
    let engine = open_engine(&config).await?;

    run(&engine, cli.command).await
}

/// Load configuration: the TOML file if present, then
/// `VAULT_*` environment variables (`__` separates nested keys). Missing
/// sections fall back to their defaults.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(config_path = %path.display(), "No config file found, using defaults");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("VAULT_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn open_engine(config: &AppConfig) -> Result<Engine> {
    let blobs = vault_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::debug!(backend = blobs.backend_name(), "Storage backend ready");

    let metadata = vault_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::debug!(backend = metadata.backend_name(), "Metadata store ready");

    Engine::new(blobs, metadata, config.engine.clone()).context("failed to initialize engine")
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            files,
            owner,
            name,
            media_type,
        } => handle_put(engine, &owner, files, name, media_type).await,
        Commands::Register { hash, owner, name } => {
            let outcome = engine
                .register_by_hash(&owner, &name, &hash)
                .await
                .map_err(coded)?;
            print_json(&outcome)
        }
        Commands::Rm {
            reference_id,
            owner,
        } => {
            let outcome = engine
                .remove_reference(reference_id, &owner)
                .await
                .map_err(coded)?;
            print_json(&outcome)
        }
        Commands::Show { reference_id } => {
            let view = engine.get_reference(reference_id).await.map_err(coded)?;
            print_json(&view)
        }
        Commands::Cat {
            reference_id,
            output,
        } => handle_cat(engine, reference_id, output.as_deref()).await,
        Commands::Ls { owner } => {
            let references = engine.list_references(&owner).await.map_err(coded)?;
            print_json(&references)
        }
        Commands::Stats { owner, metrics } => {
            if metrics {
                let text = vault_engine::metrics::encode_text()
                    .context("failed to encode metrics")?;
                print!("{text}");
                return Ok(());
            }
            match owner {
                Some(owner) => print_json(&engine.owner_usage(&owner).await.map_err(coded)?),
                None => print_json(&engine.stats().await.map_err(coded)?),
            }
        }
        Commands::SweepTmp { older_than_secs } => {
            let removed = engine
                .sweep_staging(older_than_secs.map(Duration::from_secs))
                .await
                .map_err(coded)?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        Commands::Health => {
            engine.health_check().await.map_err(coded)?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
    }
}

type Body = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Serialize)]
struct PutResult {
    display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<vault_engine::UploadOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

async fn handle_put(
    engine: &Engine,
    owner: &str,
    files: Vec<PathBuf>,
    name: Option<String>,
    media_type: Option<String>,
) -> Result<()> {
    if name.is_some() && files.len() > 1 {
        anyhow::bail!("--name can only be used with a single file");
    }
    if files.len() > 1 && files.iter().any(|f| f.as_os_str() == "-") {
        anyhow::bail!("stdin (`-`) can only be uploaded on its own");
    }

    let mut items = Vec::with_capacity(files.len());
    for file in &files {
        let body: Body = if file.as_os_str() == "-" {
            Box::new(tokio::io::stdin())
        } else {
            Box::new(
                tokio::fs::File::open(file)
                    .await
                    .with_context(|| format!("failed to open {}", file.display()))?,
            )
        };
        items.push(UploadItem {
            display_name: name.clone().unwrap_or_else(|| display_name_for(file)),
            declared_media_type: media_type.clone(),
            body,
        });
    }

    let names: Vec<String> = items.iter().map(|i| i.display_name.clone()).collect();
    let results = engine.upload_many(owner, items).await;

    let mut failed = 0usize;
    let report: Vec<PutResult> = names
        .into_iter()
        .zip(results)
        .map(|(display_name, result)| match result {
            Ok(outcome) => PutResult {
                display_name,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => {
                failed += 1;
                tracing::error!(display_name = %display_name, error = %err, "Upload failed");
                PutResult {
                    display_name,
                    outcome: None,
                    error: Some(ErrorBody {
                        code: err.code(),
                        message: err.to_string(),
                    }),
                }
            }
        })
        .collect();

    print_json(&report)?;
    if failed > 0 {
        anyhow::bail!("{failed} of {} uploads failed", report.len());
    }
    Ok(())
}

async fn handle_cat(engine: &Engine, reference_id: Uuid, output: Option<&Path>) -> Result<()> {
    let (view, mut stream) = engine.open(reference_id).await.map_err(coded)?;

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("failed to read blob")?;
        written += chunk.len() as u64;
        sink.write_all(&chunk).await.context("failed to write output")?;
    }
    sink.flush().await.context("failed to write output")?;

    tracing::debug!(
        reference_id = %reference_id,
        location = %view.payload.location,
        bytes = written,
        "Payload written"
    );
    Ok(())
}

/// Display name for an uploaded path: its file name, or `stdin`.
fn display_name_for(path: &Path) -> String {
    if path.as_os_str() == "-" {
        return "stdin".to_string();
    }
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Attach the stable error code to an engine error.
fn coded(err: EngineError) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}
