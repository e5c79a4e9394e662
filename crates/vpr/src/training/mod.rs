pub mod cache;
pub mod config;
pub mod loss;
pub mod metrics;
pub mod partition;
pub mod trainer;

pub use cache::{build_cache, cache_path, useful_indices};
pub use config::{LossDenominator, TrainConfig};
pub use loss::{
    domain_loss, triplet_loss, TripletCriterion, TripletMarginLoss, TripletMarginLossConfig,
};
pub use metrics::{format_elapsed, BatchOutcome, EpochReport, LossAccumulator};
pub use partition::SubsetPartition;
pub use trainer::{partition_rng, train_epoch};
