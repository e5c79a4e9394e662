//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use feature_store::{read_cache_file, read_summary};
use serde::Serialize;
use vpr::data::DbStruct;
use vpr::eval::recall_from_descriptors;
use vpr::{EvalConfig, RecallReport, TrainConfig};

use crate::config::{build_eval_config, build_train_config, load_or_default};

type CliBackend = NdArray<f32>;

/// Arguments for the `recall` subcommand.
#[derive(Debug)]
pub struct RecallArgs {
    /// Descriptor cache file (Parquet, or HDF5 by extension): gallery rows
    /// first, then queries.
    pub descriptors: PathBuf,
    pub num_gallery: usize,
    /// JSON array with one list of positive gallery indices per query.
    pub positives: PathBuf,
    pub config: Option<PathBuf>,
    pub on_device: bool,
    /// Optional JSON output path.
    pub output: Option<PathBuf>,
}

/// Arguments for the `cache-summary` subcommand.
#[derive(Debug)]
pub struct CacheSummaryArgs {
    pub input: PathBuf,
    pub json: bool,
}

/// Arguments for the `show-config` subcommand.
#[derive(Debug)]
pub struct ShowConfigArgs {
    pub config: Option<PathBuf>,
}

/// Written by `recall --output`.
#[derive(Debug, Serialize)]
pub struct RecallResult {
    pub descriptors: String,
    pub num_gallery: usize,
    pub num_queries: usize,
    pub dim: usize,
    pub on_device: bool,
    pub report: RecallReport,
}

#[derive(Debug, Serialize)]
struct ResolvedConfig<'a> {
    train: &'a TrainConfig,
    eval: &'a EvalConfig,
}

fn load_positives(path: &Path) -> anyhow::Result<Vec<Vec<usize>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open positives {}: {e}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Failed to parse positives {}: {e}", path.display()))
}

/// Score recall@N for precomputed descriptors.
pub fn run_recall(args: RecallArgs) -> anyhow::Result<RecallReport> {
    let start = Instant::now();
    let toml = load_or_default(args.config.as_deref())?;
    let config = build_eval_config(&toml.eval, args.on_device)?;

    let features = read_cache_file(&args.descriptors)?;
    if args.num_gallery > features.rows() {
        anyhow::bail!(
            "--num-gallery {} exceeds the {} rows in {}",
            args.num_gallery,
            features.rows(),
            args.descriptors.display()
        );
    }
    let db = DbStruct {
        num_gallery: args.num_gallery,
        num_queries: features.rows() - args.num_gallery,
    };
    let positives = load_positives(&args.positives)?;
    if positives.len() != db.num_queries {
        anyhow::bail!(
            "{} has {} positive lists but the descriptor file holds {} queries",
            args.positives.display(),
            positives.len(),
            db.num_queries
        );
    }
    tracing::info!(
        gallery = db.num_gallery,
        queries = db.num_queries,
        dim = features.dim(),
        on_device = config.index_on_device,
        "Scoring descriptors"
    );

    let device = Default::default();
    let report = recall_from_descriptors::<CliBackend>(
        &config.n_values,
        config.index_on_device,
        &features,
        db,
        &positives,
        &device,
    )?;

    println!("--- Recall ---");
    for (n, r) in &report.recalls {
        println!("Recall@{n}: {:.1}%", r * 100.0);
    }
    println!("{}", report.formatted);
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());

    if let Some(output) = &args.output {
        let result = RecallResult {
            descriptors: args.descriptors.display().to_string(),
            num_gallery: db.num_gallery,
            num_queries: db.num_queries,
            dim: features.dim(),
            on_device: config.index_on_device,
            report: report.clone(),
        };
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        serde_json::to_writer_pretty(std::fs::File::create(output)?, &result)?;
        tracing::info!(path = %output.display(), "Wrote recall results");
    }

    Ok(report)
}

/// Print row statistics of a feature cache file.
pub fn run_cache_summary(args: CacheSummaryArgs) -> anyhow::Result<()> {
    let summary = read_summary(&args.input)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("--- Cache Summary ---");
    println!("File: {}", args.input.display());
    println!("Rows: {}", summary.rows);
    println!("Dimension: {}", summary.dim);
    println!("Non-zero rows: {}", summary.nonzero_rows);
    if summary.rows > 0 {
        let rate = summary.nonzero_rows as f64 / summary.rows as f64 * 100.0;
        println!("Filled: {rate:.1}%");
    }

    Ok(())
}

/// Print the resolved train and eval configs as JSON.
pub fn run_show_config(args: ShowConfigArgs) -> anyhow::Result<()> {
    let toml = load_or_default(args.config.as_deref())?;
    let train = build_train_config(&toml.train);
    train.validate()?;
    let eval = build_eval_config(&toml.eval, false)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&ResolvedConfig {
            train: &train,
            eval: &eval,
        })?
    );
    Ok(())
}
