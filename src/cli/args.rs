//! CLI argument definitions.

use super::validators::{parse_positive, parse_threshold};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Identity resolution for camera-trap wildlife detections.
#[derive(Debug, Parser)]
#[command(name = "wildid")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (default: platform config directory).
    #[arg(long, global = true, env = "WILDID_CONFIG")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors; hide progress bars.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest detector batch files and resolve every detection.
    Resolve {
        /// Detector output batch files (JSON).
        #[arg(required = true)]
        batches: Vec<PathBuf>,

        /// Run options.
        #[command(flatten)]
        run: RunArgs,
    },
    /// Re-run every unresolved detection from its last completed stage.
    Retry {
        /// Run options.
        #[command(flatten)]
        run: RunArgs,
    },
    /// List identities.
    Identities {
        /// Only list identities in this partition.
        #[arg(long)]
        partition: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Database options.
        #[command(flatten)]
        store: StoreArgs,
    },
    /// List unresolved detections with their state and retry counts.
    Pending {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Database options.
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Manage configuration.
    Config {
        /// Configuration action to perform.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommand actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Create a configuration file with documented defaults.
    Init,
    /// Display current configuration.
    Show,
    /// Print configuration file path.
    Path,
    /// Validate the configuration, including the partition table.
    Check,
}

/// Database selection.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// SQLite database file (default: platform data directory).
    #[arg(long, env = "WILDID_DATABASE")]
    pub database: Option<PathBuf>,
}

/// Options shared by `resolve` and `retry`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Database options.
    #[command(flatten)]
    pub store: StoreArgs,

    /// Keep everything in memory; nothing is persisted.
    #[arg(long, conflicts_with = "database")]
    pub in_memory: bool,

    /// Cosine similarity needed to accept a match (0.0-1.0).
    #[arg(long, value_parser = parse_threshold, env = "WILDID_SIMILARITY_THRESHOLD")]
    pub similarity_threshold: Option<f32>,

    /// Maximum number of tasks running at once.
    #[arg(long, value_parser = parse_positive, env = "WILDID_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Embedding service URL.
    #[arg(long, env = "WILDID_EMBEDDER_URL")]
    pub embedder_url: Option<String>,

    /// Directory relative image paths are resolved against.
    #[arg(long)]
    pub image_root: Option<PathBuf>,

    /// Hide progress bars.
    #[arg(long)]
    pub no_progress: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,
}
