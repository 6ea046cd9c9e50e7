//! # Dragnet CLI
//!
//! The `dragnet` binary drives the ingestion engine. All commands accept a
//! `--config` flag pointing to a TOML configuration file; see
//! `config/dragnet.example.toml` for a full example.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dragnet init` | Create the manifest database (idempotent) |
//! | `dragnet run-chunk` | Fetch one bounded chunk per partition |
//! | `dragnet status` | Show gaps and estimated remaining work |
//! | `dragnet rebuild-manifest` | Reconstruct the manifest from raw storage |
//! | `dragnet consolidate <dataset>` | Rebuild the consolidated artifact |
//!
//! ## Examples
//!
//! ```bash
//! # One chunk for every configured partition
//! dragnet run-chunk --config ./config/dragnet.toml
//!
//! # Re-scrape a known-bad range, replacing manifest rows
//! dragnet run-chunk --partition EPL --start 2000100 --end 2000180 --force
//!
//! # What's left?
//! dragnet status --partition EPL
//!
//! # Merge one freshly synced partition into the artifact
//! dragnet consolidate match_stats --partition EPL
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use dragnet::backfill::{run_chunks, RunChunkArgs};
use dragnet::config;
use dragnet::consolidate::run_consolidate;
use dragnet::manifest::{run_rebuild, ManifestStore};
use dragnet::progress::ProgressMode;
use dragnet::status::run_status;

/// Dragnet — a manifest-driven incremental ingestion engine for id-probed
/// data sources.
#[derive(Parser)]
#[command(
    name = "dragnet",
    about = "Dragnet — manifest-driven incremental ingestion for id-probed data sources",
    version,
    long_about = "Dragnet sweeps bounded, partitioned id spaces of a remote source by probing \
    individual ids under a strict rate limit, keeps a durable manifest of everything fetched, \
    resumes from exactly the missing work after any interruption, and consolidates partitioned \
    raw outputs into per-dataset artifacts without silently truncating them."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dragnet.toml")]
    config: PathBuf,

    /// Progress reporting on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the manifest database.
    ///
    /// Creates the SQLite file and schema. Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Fetch one bounded chunk of missing ids per partition.
    ///
    /// Computes gaps from the manifest, selects the lowest-id chunk, and
    /// probes each id sequentially under the configured rate limit. Stops a
    /// partition early when too many consecutive ids come back not-found
    /// (the band has likely been scanned past its real data). Run it again
    /// to continue exactly where this run left off.
    RunChunk {
        /// Only this partition (default: all configured partitions in order).
        #[arg(long)]
        partition: Option<String>,

        /// Start of an explicit override range (requires --partition and --end).
        /// Bypasses gap computation for manual re-scrapes.
        #[arg(long)]
        start: Option<u64>,

        /// End of the override range, inclusive.
        #[arg(long)]
        end: Option<u64>,

        /// Maximum ids per chunk (default from config).
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Minimum milliseconds between requests (default from config).
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Re-fetch ids already present in the manifest, replacing their rows.
        #[arg(long)]
        force: bool,

        /// Re-probe ids previously confirmed missing by the source.
        #[arg(long)]
        retry_missing: bool,
    },

    /// Show coverage, gaps, and estimated remaining work.
    Status {
        /// Only this partition; also lists its next gaps.
        #[arg(long)]
        partition: Option<String>,
    },

    /// Reconstruct the manifest from the raw record tree.
    ///
    /// The recovery path for a lost or corrupt manifest: scans every stored
    /// record and rebuilds the flat table from scratch.
    RebuildManifest,

    /// Rebuild the consolidated artifact for a dataset.
    ///
    /// Refuses to run when partitions known to the manifest (or present in
    /// the existing artifact) have no raw outputs on local disk, because
    /// that rebuild would silently drop their data.
    Consolidate {
        /// Dataset to consolidate (e.g. `match_stats`).
        dataset: String,

        /// Merge only this partition into the existing artifact instead of
        /// rebuilding it wholesale.
        #[arg(long)]
        partition: Option<String>,

        /// Assert that all partitions' raw outputs have been synced locally,
        /// bypassing the completeness check.
        #[arg(long)]
        assume_synced: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    let progress_mode: ProgressMode = cli
        .progress
        .map(Into::into)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            let store = ManifestStore::open(&cfg.db.path).await?;
            store.close().await;
            println!("Manifest database initialized successfully.");
        }
        Commands::RunChunk {
            partition,
            start,
            end,
            chunk_size,
            delay_ms,
            force,
            retry_missing,
        } => {
            let args = RunChunkArgs {
                partition,
                start,
                end,
                chunk_size,
                delay_ms,
                force,
                retry_missing,
            };
            run_chunks(&cfg, &args, progress_mode.reporter().as_ref()).await?;
        }
        Commands::Status { partition } => {
            run_status(&cfg, partition.as_deref()).await?;
        }
        Commands::RebuildManifest => {
            run_rebuild(&cfg).await?;
        }
        Commands::Consolidate {
            dataset,
            partition,
            assume_synced,
        } => {
            run_consolidate(&cfg, &dataset, partition.as_deref(), assume_synced).await?;
        }
    }

    Ok(())
}
