//! TOML config loading for the vpr CLI.
//!
//! `configs/vpr.toml` has optional `[train]` and `[eval]` sections. Every
//! field is optional; missing fields keep the library defaults, and CLI flags
//! are applied last.

use std::path::Path;

use feature_store::CacheFormat;
use serde::Deserialize;
use vpr::{EvalConfig, LossDenominator, TrainConfig};

/// Top-level structure matching `configs/vpr.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VprToml {
    #[serde(default)]
    pub train: TrainOverrides,
    #[serde(default)]
    pub eval: EvalOverrides,
}

/// Optional overrides for `TrainConfig` fields.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainOverrides {
    pub encoder_dim: Option<usize>,
    pub num_clusters: Option<usize>,
    pub cache_refresh_rate: Option<usize>,
    pub epoch_divider: Option<usize>,
    pub batch_size: Option<usize>,
    pub cache_batch_size: Option<usize>,
    pub num_workers: Option<usize>,
    pub lr: Option<f64>,
    pub margin: Option<f64>,
    pub grl: Option<bool>,
    pub grl_batch_size: Option<usize>,
    pub grl_loss_weight: Option<f64>,
    pub output_folder: Option<String>,
    pub cache_format: Option<CacheFormat>,
    pub loss_denominator: Option<LossDenominator>,
    pub seed: Option<u64>,
}

/// Optional overrides for `EvalConfig` fields.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalOverrides {
    pub encoder_dim: Option<usize>,
    pub num_clusters: Option<usize>,
    pub cache_batch_size: Option<usize>,
    pub num_workers: Option<usize>,
    pub n_values: Option<Vec<usize>>,
    pub index_on_device: Option<bool>,
}

/// Load and deserialize a `VprToml` from a TOML file.
pub fn load_vpr_toml(path: &Path) -> anyhow::Result<VprToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: VprToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded vpr config");
    Ok(config)
}

/// Load the TOML file if one was given, otherwise use defaults.
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<VprToml> {
    match path {
        Some(p) => load_vpr_toml(p),
        None => Ok(VprToml::default()),
    }
}

/// Build a `TrainConfig`: library defaults < TOML values.
pub fn build_train_config(overrides: &TrainOverrides) -> TrainConfig {
    let mut config = TrainConfig::new();
    if let Some(v) = overrides.encoder_dim {
        config.encoder_dim = v;
    }
    if let Some(v) = overrides.num_clusters {
        config.num_clusters = v;
    }
    if let Some(v) = overrides.cache_refresh_rate {
        config.cache_refresh_rate = v;
    }
    if let Some(v) = overrides.epoch_divider {
        config.epoch_divider = v;
    }
    if let Some(v) = overrides.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = overrides.cache_batch_size {
        config.cache_batch_size = v;
    }
    if let Some(v) = overrides.num_workers {
        config.num_workers = v;
    }
    if let Some(v) = overrides.lr {
        config.lr = v;
    }
    if let Some(v) = overrides.margin {
        config.margin = v;
    }
    if let Some(v) = overrides.grl {
        config.grl = v;
    }
    if let Some(v) = overrides.grl_batch_size {
        config.grl_batch_size = v;
    }
    if let Some(v) = overrides.grl_loss_weight {
        config.grl_loss_weight = v;
    }
    if let Some(v) = &overrides.output_folder {
        config.output_folder = v.clone();
    }
    if let Some(v) = overrides.cache_format {
        config.cache_format = v;
    }
    if let Some(v) = overrides.loss_denominator {
        config.loss_denominator = v;
    }
    if overrides.seed.is_some() {
        config.seed = overrides.seed;
    }
    config
}

/// Build an `EvalConfig`: library defaults < TOML values < CLI `--on-device`.
pub fn build_eval_config(overrides: &EvalOverrides, on_device_cli: bool) -> anyhow::Result<EvalConfig> {
    let mut config = EvalConfig::new();
    if let Some(v) = overrides.encoder_dim {
        config.encoder_dim = v;
    }
    if let Some(v) = overrides.num_clusters {
        config.num_clusters = v;
    }
    if let Some(v) = overrides.cache_batch_size {
        config.cache_batch_size = v;
    }
    if let Some(v) = overrides.num_workers {
        config.num_workers = v;
    }
    if let Some(v) = &overrides.n_values {
        config.n_values = v.clone();
    }
    if let Some(v) = overrides.index_on_device {
        config.index_on_device = v;
    }

    if on_device_cli {
        config.index_on_device = true;
    }

    if config.n_values.is_empty() {
        anyhow::bail!("eval.n_values must not be empty");
    }
    Ok(config)
}
