//! Wildid - identity resolution for camera-trap wildlife detections.
//!
//! Detector output for each image goes through duplicate suppression, burst
//! linking and appearance matching, and every surviving detection ends up
//! linked to a persistent identity (one tracked individual).

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod constants;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod imagery;
pub mod index;
pub mod ingest;
pub mod locking;
pub mod pipeline;
pub mod store;

use clap::Parser;
use cli::{Cli, Command, ConfigAction, RunArgs, StoreArgs};
use config::{Config, Settings, build_settings, config_file_path, database_path};
use embedding::HttpEmbedder;
use imagery::FsCropSource;
use index::MemoryIndex;
use ingest::ImageRecord;
use locking::DatabaseLock;
use pipeline::{Orchestrator, RunSummary, rebuild_index};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{MemoryStore, SqliteStore, Store};
use tracing::{info, warn};

pub use error::{Error, Result};

/// Main entry point for the wildid CLI.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    // Remove the database lock if the run is interrupted.
    if let Err(e) = ctrlc::set_handler(|| {
        locking::cleanup_all_locks();
        std::process::exit(130); // 128 + SIGINT(2)
    }) {
        warn!("Failed to install Ctrl+C handler: {e}");
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path()?,
    };

    match cli.command {
        Command::Config { action } => handle_config_command(action, &config_path),
        Command::Resolve { batches, run } => {
            let config = config::load_config_file(&config_path)?;
            resolve(&config, &run, Some(&batches), cli.quiet)
        }
        Command::Retry { run } => {
            let config = config::load_config_file(&config_path)?;
            resolve(&config, &run, None, cli.quiet)
        }
        Command::Identities {
            partition,
            json,
            store,
        } => {
            let config = config::load_config_file(&config_path)?;
            list_identities(&config, &store, partition.as_deref(), json)
        }
        Command::Pending { json, store } => {
            let config = config::load_config_file(&config_path)?;
            list_pending(&config, &store, json)
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter_str = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info,reqwest=warn,hyper=warn",
            1 => "debug,reqwest=warn,hyper=warn",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal {
        message: format!("Failed to create async runtime: {e}"),
    })
}

/// Apply command-line overrides and validate.
fn run_settings(config: &Config, args: &RunArgs) -> Result<Settings> {
    let mut config = config.clone();
    if let Some(threshold) = args.similarity_threshold {
        config.resolution.similarity_threshold = Some(threshold);
    }
    if let Some(concurrency) = args.concurrency {
        config.pipeline.concurrency = concurrency;
    }
    if let Some(url) = &args.embedder_url {
        config.embedder.endpoint = Some(url.clone());
    }
    build_settings(&config)
}

fn database_for(config: &Config, store: &StoreArgs) -> Result<PathBuf> {
    database_path(
        store
            .database
            .as_deref()
            .or(config.storage.database.as_deref()),
    )
}

/// Ingest batches (or pick up the backlog when `batches` is `None`) and run
/// the pipeline to completion.
fn resolve(
    config: &Config,
    args: &RunArgs,
    batches: Option<&[PathBuf]>,
    quiet: bool,
) -> Result<()> {
    let settings = run_settings(config, args)?;
    let endpoint = settings
        .embedder
        .endpoint
        .clone()
        .ok_or_else(|| Error::ConfigValidation {
            message: "no embedding service configured (set embedder.endpoint or pass \
                      --embedder-url)"
                .to_string(),
        })?;

    let mut records: Vec<ImageRecord> = Vec::new();
    for batch in batches.unwrap_or_default() {
        records.extend(ingest::read_batch(batch)?);
    }

    let (store, _lock): (Arc<dyn Store>, Option<DatabaseLock>) = if args.in_memory {
        (Arc::new(MemoryStore::new()), None)
    } else {
        let db = database_for(config, &args.store)?;
        if let Some(parent) = db.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let lock = DatabaseLock::acquire(&db)?;
        (Arc::new(SqliteStore::open(&db)?), Some(lock))
    };

    info!(
        "Similarity threshold {:.3}, IoU threshold {:.2}, burst window {}s, {} partition(s)",
        settings.resolution.similarity_threshold,
        settings.resolution.iou_threshold,
        settings.resolution.burst_window.as_secs(),
        settings.partitions.partitions().len()
    );

    let progress_enabled = !quiet && !args.no_progress;
    let runtime = runtime()?;
    let summary = runtime.block_on(async {
        let index = Arc::new(MemoryIndex::new(settings.embedder.dimension));
        let loaded = rebuild_index(store.as_ref(), index.as_ref()).await?;
        if loaded > 0 {
            info!("Indexed {} known identities", loaded);
        }

        let embedder = Arc::new(HttpEmbedder::new(
            &endpoint,
            settings.embedder.dimension,
            settings.embedder.timeout,
        )?);
        let crops = Arc::new(
            args.image_root
                .as_ref()
                .map_or_else(FsCropSource::new, FsCropSource::with_root),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            &settings,
            Arc::clone(&store),
            index,
            embedder,
            crops,
        ));

        let tasks = if batches.is_some() {
            orchestrator.ingest(&records).await?
        } else {
            orchestrator.pending_tasks().await?
        };
        info!("Scheduling {} task(s)", tasks.len());

        let pb = cli::progress::create_task_progress(tasks.len(), progress_enabled);
        let summary = orchestrator.run(tasks, pb.clone()).await;
        cli::progress::finish_progress(pb, "Complete");
        Ok::<RunSummary, Error>(summary)
    })?;

    report_summary(&summary, args.json)
}

#[allow(clippy::print_stdout)]
fn report_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(summary)
            .map_err(|e| Error::OutputSerialize { source: e })?;
        println!("{text}");
    } else {
        info!(
            "Complete: {} image(s), {} keeper(s), {} duplicate(s); {} resolved \
             ({} burst, {} matched, {} new identities), {} rejected, {} failed, {} retries",
            summary.images,
            summary.keepers,
            summary.duplicates,
            summary.resolved(),
            summary.burst_reused,
            summary.matched,
            summary.created,
            summary.rejected,
            summary.failed,
            summary.retries
        );
    }
    if summary.failed > 0 {
        warn!(
            "{} task(s) failed; run 'wildid pending' to inspect and 'wildid retry' to resume",
            summary.failed
        );
    }
    Ok(())
}

fn open_for_reading(config: &Config, store: &StoreArgs) -> Result<SqliteStore> {
    let db = database_for(config, store)?;
    if !db.exists() {
        return Err(Error::PersistenceFailed {
            reason: format!("database '{}' does not exist", db.display()),
        });
    }
    SqliteStore::open(&db)
}

fn list_identities(
    config: &Config,
    store: &StoreArgs,
    partition: Option<&str>,
    json: bool,
) -> Result<()> {
    let store = open_for_reading(config, store)?;
    let mut identities = runtime()?.block_on(store.identities())?;
    if let Some(partition) = partition {
        identities.retain(|i| i.partition.as_str() == partition);
    }
    cli::listing::write_identities(&mut std::io::stdout().lock(), &identities, json)
}

fn list_pending(config: &Config, store: &StoreArgs, json: bool) -> Result<()> {
    let store = open_for_reading(config, store)?;
    let pending = runtime()?.block_on(store.unresolved_detections())?;
    cli::listing::write_pending(&mut std::io::stdout().lock(), &pending, json)
}

#[allow(clippy::print_stdout)]
fn handle_config_command(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => {
            if path.exists() {
                println!("Configuration file already exists: {}", path.display());
            } else {
                config::save_config(&Config::template(), path)?;
                println!("Created configuration file: {}", path.display());
                println!("\nNext steps:");
                println!("  set embedder.endpoint to your embedding service URL");
                println!("  review resolution.similarity_threshold and the [partitions] table");
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = config::load_config_file(path)?;
            let text = toml::to_string_pretty(&config)
                .map_err(|e| Error::ConfigSerialize { source: e })?;
            print!("{text}");
            Ok(())
        }
        ConfigAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
        ConfigAction::Check => {
            let config = config::load_config_file(path)?;
            let settings = build_settings(&config)?;
            println!("Configuration OK");
            for label in domain::Classification::ALL {
                println!(
                    "  {:<16} -> {}",
                    label.as_str(),
                    settings.partitions.partition_for(label)
                );
            }
            if settings.embedder.endpoint.is_none() {
                println!("  (embedder.endpoint is not set; resolve and retry will refuse to run)");
            }
            Ok(())
        }
    }
}
