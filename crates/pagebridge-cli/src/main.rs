//! Pagebridge CLI
//!
//! Command-line front end for the sync engine:
//! - Inspecting the remote folder/collection tree (`tree`)
//! - Pushing a rendered batch and writing destination ids back (`push`)
//! - Re-running cross-reference resolution on its own (`links`)
//! - Minting document identifiers (`new-id`)

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use pagebridge_sync::{
    FsAssetSource, HttpTransport, IdentityResolver, InMemoryMetadata, MetadataStore,
    RenderedDocument, SyncConfig, SyncEvent, SyncSession, UpsertStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pagebridge")]
#[command(
    author,
    version,
    about = "Pagebridge: push a local document vault into a remote page hierarchy"
)]
struct Cli {
    /// JSON config file (environment variables override its values)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the remote folder and collection tree
    Tree,

    /// Sync a rendered batch file and write destination ids back into it
    Push {
        /// Batch JSON: `{ "documents": [...], "metadata": {...} }`
        batch: PathBuf,
        /// Vault directory embedded images are read from
        #[arg(long)]
        vault: Option<PathBuf>,
        /// Overwrite destination ids already present in metadata
        #[arg(long)]
        refresh: bool,
        /// Stop at the first failed document
        #[arg(long)]
        stop_on_error: bool,
    },

    /// Resolve pending cross references across all synced pages
    Links,

    /// Generate fresh document identifiers
    NewId {
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Avoid identifiers already used in this batch's metadata
        #[arg(long)]
        batch: Option<PathBuf>,
    },
}

// ============================================================================
// Batch files
// ============================================================================

/// Rendered documents plus the metadata the engine reads and writes back.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BatchFile {
    #[serde(default)]
    documents: Vec<RenderedDocument>,
    #[serde(default)]
    metadata: BTreeMap<String, Map<String, Value>>,
}

impl BatchFile {
    fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut batch: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing batch {}", path.display()))?;
        for document in &batch.documents {
            batch
                .metadata
                .entry(document.source_path.clone())
                .or_default();
        }
        Ok(batch)
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Tree => cmd_tree(config).await,
        Commands::Push {
            batch,
            vault,
            refresh,
            stop_on_error,
        } => cmd_push(config, &batch, vault, refresh, stop_on_error).await,
        Commands::Links => cmd_links(config).await,
        Commands::NewId { count, batch } => cmd_new_id(&config, count, batch.as_deref()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?
            .with_env_overrides(),
        None => SyncConfig::from_env(),
    };
    debug!(url = %config.base_url, client = %config.client_id, "configuration loaded");
    Ok(config)
}

async fn connect(
    config: SyncConfig,
    metadata: Arc<dyn MetadataStore>,
    vault: &Path,
) -> Result<SyncSession> {
    let transport = Arc::new(HttpTransport::new(&config)?);
    let source = Arc::new(FsAssetSource::new(vault));
    let session = SyncSession::connect(config, transport, metadata, source).await?;
    Ok(session)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_tree(config: SyncConfig) -> Result<()> {
    let session = connect(config, Arc::new(InMemoryMetadata::new()), Path::new(".")).await?;
    let cache = session.hierarchy();

    let mut folders: Vec<_> = cache.folders().collect();
    folders.sort_by(|a, b| a.full_path.cmp(&b.full_path));
    for folder in folders {
        let indent = "  ".repeat(folder.depth.saturating_sub(1) as usize);
        println!("{indent}{} {}", folder.name.bold(), folder.id.dimmed());
    }

    let mut collections: Vec<_> = cache.collections().collect();
    collections.sort_by(|a, b| a.full_path.cmp(&b.full_path));
    for collection in collections {
        println!(
            "  {} {} ({} pages) {}",
            "→".yellow(),
            collection.full_path,
            collection.pages.len(),
            collection.id.dimmed()
        );
    }

    let stats = cache.stats();
    println!(
        "{} {} folders, {} collections, {} pages",
        "remote".green().bold(),
        stats.folders,
        stats.collections,
        stats.pages
    );
    session.close();
    Ok(())
}

async fn cmd_push(
    mut config: SyncConfig,
    batch_path: &Path,
    vault: Option<PathBuf>,
    refresh: bool,
    stop_on_error: bool,
) -> Result<()> {
    let batch = BatchFile::load(batch_path)?;
    let vault = vault.unwrap_or_else(|| PathBuf::from("."));
    if config.vault_root.is_none() {
        config.vault_root = fs::canonicalize(&vault)
            .ok()
            .map(|p| p.display().to_string());
    }
    config.refresh_destination |= refresh;
    if stop_on_error {
        config.continue_on_error = false;
    }

    println!(
        "{} {} documents from {}",
        "Pushing".green().bold(),
        batch.documents.len(),
        batch_path.display()
    );

    let metadata = Arc::new(InMemoryMetadata::from_map(batch.metadata.clone()));
    let mut session = connect(config, metadata.clone(), &vault).await?;
    session.on_event(Box::new(print_event));
    let report = session.sync_batch(&batch.documents).await;
    let stats = session.close();

    BatchFile {
        documents: batch.documents,
        metadata: metadata.snapshot(),
    }
    .save(batch_path)?;

    println!(
        "{} {} created, {} updated, {} failed, {} assets uploaded",
        "done".green().bold(),
        stats.created,
        stats.updated,
        stats.failed,
        stats.assets_uploaded
    );
    if !report.failed.is_empty() {
        return Err(anyhow!("{} document(s) failed", report.failed.len()));
    }
    Ok(())
}

async fn cmd_links(config: SyncConfig) -> Result<()> {
    let mut session = connect(config, Arc::new(InMemoryMetadata::new()), Path::new(".")).await?;
    let report = session.resolve_links().await;

    for page in &report.pages {
        let marker = if page.unresolved == 0 {
            "ok".green().bold()
        } else {
            "partial".yellow().bold()
        };
        println!(
            "{marker} {} ({} resolved, {} unresolved)",
            page.title, page.resolved, page.unresolved
        );
    }
    for (page, error) in &report.failed {
        eprintln!("{} {page}: {error}", "failed".red().bold());
    }
    println!(
        "{} scanned {} pages, rewrote {}",
        "links".green().bold(),
        report.scanned,
        report.pages.iter().filter(|p| p.persisted).count()
    );
    session.close();
    Ok(())
}

fn cmd_new_id(config: &SyncConfig, count: usize, batch: Option<&Path>) -> Result<()> {
    let metadata = match batch {
        Some(path) => InMemoryMetadata::from_map(BatchFile::load(path)?.metadata),
        None => InMemoryMetadata::new(),
    };
    let mut resolver = IdentityResolver::new(Arc::new(metadata), config.identity_field.clone());
    let none = HashSet::new();
    for _ in 0..count {
        println!("{}", resolver.generate_id(&none));
    }
    Ok(())
}

fn print_event(event: SyncEvent) {
    match event {
        SyncEvent::DocumentSynced {
            source_path,
            status,
            page_id,
            created_folders,
            ..
        } => {
            let label = match status {
                UpsertStatus::Created => "created".green().bold(),
                UpsertStatus::Updated => "updated".cyan().bold(),
            };
            if created_folders > 0 {
                println!("{label} {source_path} → {page_id} (+{created_folders} folders)");
            } else {
                println!("{label} {source_path} → {page_id}");
            }
        }
        SyncEvent::DocumentFailed {
            source_path, stage, ..
        } => {
            eprintln!("{} {source_path} at {stage}", "failed".red().bold());
        }
        SyncEvent::AssetsTransferred {
            uploaded,
            skipped,
            failed,
        } if uploaded + skipped + failed > 0 => {
            println!(
                "  {} {uploaded} uploaded, {skipped} already remote, {failed} failed",
                "assets".yellow()
            );
        }
        SyncEvent::LinksResolved { pages, unresolved } if pages > 0 => {
            println!(
                "  {} {pages} pages rewritten, {unresolved} links unresolved",
                "links".yellow()
            );
        }
        // Notices are already logged at warn level.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_load_registers_metadata_for_every_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        fs::write(
            &path,
            r#"{
                "documents": [
                    { "sourcePath": "a.md", "title": "A", "content": "<p>a</p>" },
                    { "sourcePath": "b.md", "title": "B", "content": "<p>b</p>" }
                ],
                "metadata": { "a.md": { "pagebridge-id": "abc" } }
            }"#,
        )
        .unwrap();

        let batch = BatchFile::load(&path).unwrap();
        assert_eq!(batch.documents.len(), 2);
        assert_eq!(batch.metadata["a.md"]["pagebridge-id"], "abc");
        assert!(batch.metadata["b.md"].is_empty());
    }

    #[test]
    fn test_batch_save_keeps_written_back_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        let mut batch = BatchFile::default();
        batch.metadata.insert("a.md".to_string(), Map::new());
        let metadata = InMemoryMetadata::from_map(batch.metadata.clone());
        metadata
            .set("a.md", "pagebridge-page-id", Value::String("P1".into()))
            .unwrap();
        batch.metadata = metadata.snapshot();
        batch.save(&path).unwrap();

        let reloaded = BatchFile::load(&path).unwrap();
        assert_eq!(reloaded.metadata["a.md"]["pagebridge-page-id"], "P1");
    }

    #[test]
    fn test_cli_parses_push_flags() {
        let cli = Cli::try_parse_from([
            "pagebridge",
            "--config",
            "cfg.json",
            "push",
            "batch.json",
            "--vault",
            "notes",
            "--refresh",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("cfg.json")));
        match cli.command {
            Commands::Push {
                batch,
                vault,
                refresh,
                stop_on_error,
            } => {
                assert_eq!(batch, PathBuf::from("batch.json"));
                assert_eq!(vault, Some(PathBuf::from("notes")));
                assert!(refresh);
                assert!(!stop_on_error);
            }
            _ => panic!("expected push"),
        }
    }
}
