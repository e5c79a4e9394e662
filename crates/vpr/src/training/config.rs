use std::path::PathBuf;

use burn::prelude::*;
use feature_store::CacheFormat;
use serde::{Deserialize, Serialize};

use crate::extract::ExtractionSettings;

/// Which batches count toward the reported average epoch loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossDenominator {
    /// Every loader batch, including skipped empty ones.
    #[default]
    AllIterations,
    /// Only batches that produced a loss.
    ValidBatches,
}

/// Configuration for triplet training with periodic cache refresh.
#[derive(Config, Debug)]
pub struct TrainConfig {
    /// Channels of the backbone feature map fed to NetVLAD.
    #[config(default = 512)]
    pub encoder_dim: usize,
    /// Number of NetVLAD clusters.
    #[config(default = 64)]
    pub num_clusters: usize,
    /// Queries per cache refresh.
    #[config(default = 1000)]
    pub cache_refresh_rate: usize,
    /// Fraction of the query set visited per epoch is `1 / epoch_divider`.
    #[config(default = 1)]
    pub epoch_divider: usize,
    /// Queries per triplet batch.
    #[config(default = 4)]
    pub batch_size: usize,
    /// Images per batch when building the cache.
    #[config(default = 24)]
    pub cache_batch_size: usize,
    /// Background loader threads; 0 loads on the training thread.
    #[config(default = 4)]
    pub num_workers: usize,
    /// Optimizer learning rate (constant).
    #[config(default = 1e-5)]
    pub lr: f64,
    /// Triplet margin.
    #[config(default = 0.1)]
    pub margin: f64,
    /// Enable the domain-adversarial auxiliary loss.
    #[config(default = false)]
    pub grl: bool,
    /// Images per domain batch, see [`DomainBatches::from_config`](crate::data::DomainBatches::from_config).
    #[config(default = 8)]
    pub grl_batch_size: usize,
    /// Weight of the domain loss in the combined gradient.
    #[config(default = 0.1)]
    pub grl_loss_weight: f64,
    /// Directory holding the feature cache.
    #[config(default = "String::from(\"runs/default\")")]
    pub output_folder: String,
    /// Container of the feature cache file.
    #[config(default = "CacheFormat::Parquet")]
    pub cache_format: CacheFormat,
    /// Denominator for the logged average loss.
    #[config(default = "LossDenominator::AllIterations")]
    pub loss_denominator: LossDenominator,
    /// Seed for the per-epoch query permutation and the domain loader's
    /// shuffles. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl TrainConfig {
    /// Descriptor dimension `D = encoder_dim * num_clusters`.
    pub fn features_dim(&self) -> usize {
        self.encoder_dim * self.num_clusters
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_folder)
    }

    /// `<output_folder>/cache.parquet` or `<output_folder>/cache.hdf5`.
    pub fn cache_file(&self) -> PathBuf {
        self.output_dir().join(self.cache_format.file_name())
    }

    pub fn cache_extraction(&self) -> ExtractionSettings {
        ExtractionSettings {
            batch_size: self.cache_batch_size,
            num_workers: self.num_workers,
            dim: self.features_dim(),
        }
    }

    /// Reject settings that would divide by zero or never make progress.
    pub fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("encoder_dim", self.encoder_dim),
            ("num_clusters", self.num_clusters),
            ("cache_refresh_rate", self.cache_refresh_rate),
            ("epoch_divider", self.epoch_divider),
            ("batch_size", self.batch_size),
            ("cache_batch_size", self.cache_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        if self.grl && self.grl_batch_size == 0 {
            anyhow::bail!("grl_batch_size must be positive when grl is enabled");
        }
        if self.margin < 0.0 {
            tracing::warn!(margin = self.margin, "Negative triplet margin");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TrainConfig::new();
        assert_eq!(cfg.features_dim(), 512 * 64);
        assert_eq!(cfg.cache_refresh_rate, 1000);
        assert_eq!(cfg.loss_denominator, LossDenominator::AllIterations);
        assert!(!cfg.grl);
        assert_eq!(cfg.cache_file(), PathBuf::from("runs/default/cache.parquet"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_rates() {
        assert!(TrainConfig::new().with_cache_refresh_rate(0).validate().is_err());
        assert!(TrainConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainConfig::new()
            .with_grl(true)
            .with_grl_batch_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_hdf5_cache_file() {
        let cfg = TrainConfig::new()
            .with_output_folder("runs/x".into())
            .with_cache_format(CacheFormat::Hdf5);
        assert_eq!(cfg.cache_file(), PathBuf::from("runs/x/cache.hdf5"));
    }

    #[test]
    fn test_cache_extraction_settings() {
        let cfg = TrainConfig::new()
            .with_encoder_dim(4)
            .with_num_clusters(2)
            .with_cache_batch_size(7)
            .with_num_workers(0);
        let s = cfg.cache_extraction();
        assert_eq!(s.dim, 8);
        assert_eq!(s.batch_size, 7);
        assert_eq!(s.num_workers, 0);
    }
}
