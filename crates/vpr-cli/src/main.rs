mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{CacheSummaryArgs, RecallArgs, ShowConfigArgs};

/// vpr: place-recognition descriptor caches and recall@N evaluation.
#[derive(Parser)]
#[command(name = "vpr", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute recall@N from a descriptor cache file.
    Recall {
        /// Descriptor Parquet or HDF5 file (gallery rows first, then queries).
        #[arg(long)]
        descriptors: PathBuf,
        /// Number of gallery rows at the start of the file.
        #[arg(long)]
        num_gallery: usize,
        /// JSON file with one list of positive gallery indices per query.
        #[arg(long)]
        positives: PathBuf,
        /// Path to the vpr config TOML file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Rank on the burn device instead of the host index.
        #[arg(long)]
        on_device: bool,
        /// Path to write JSON results.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print statistics from a feature cache file.
    CacheSummary {
        /// Path to the cache file.
        #[arg(long)]
        input: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
    /// Validate a config file and print the resolved settings.
    ShowConfig {
        /// Path to the vpr config TOML file.
        #[arg(long, default_value = "configs/vpr.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Recall {
            descriptors,
            num_gallery,
            positives,
            config,
            on_device,
            output,
        } => pipeline::run_recall(RecallArgs {
            descriptors,
            num_gallery,
            positives,
            config,
            on_device,
            output,
        })
        .map(|_| ()),
        Command::CacheSummary { input, json } => {
            pipeline::run_cache_summary(CacheSummaryArgs { input, json })
        }
        Command::ShowConfig { config } => pipeline::run_show_config(ShowConfigArgs {
            config: Some(config),
        }),
    }
}
