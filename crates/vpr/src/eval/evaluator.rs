//! Recall@N evaluation over a gallery + query set.

use std::sync::Arc;

use burn::prelude::*;
use feature_store::DescriptorMatrix;

use crate::data::{DbStruct, PlaceDataset};
use crate::eval::index::{FlatL2Index, NearestNeighborIndex, TensorFlatL2Index};
use crate::eval::recall::{compute_recalls, RecallReport};
use crate::extract::{extract_descriptors, ExtractionSettings};
use crate::model::PlaceModel;

/// Configuration for retrieval evaluation.
#[derive(Config, Debug)]
pub struct EvalConfig {
    #[config(default = 512)]
    pub encoder_dim: usize,
    #[config(default = 64)]
    pub num_clusters: usize,
    /// Images per extraction batch.
    #[config(default = 24)]
    pub cache_batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    /// Recall cutoffs, strictly increasing. The largest is the search depth.
    #[config(default = "vec![1, 5, 10, 20]")]
    pub n_values: Vec<usize>,
    /// Rank on the model's burn device instead of the host.
    #[config(default = false)]
    pub index_on_device: bool,
}

impl EvalConfig {
    pub fn features_dim(&self) -> usize {
        self.encoder_dim * self.num_clusters
    }

    /// Neighbours retrieved per query.
    pub fn search_depth(&self) -> usize {
        self.n_values.iter().copied().max().unwrap_or(0)
    }
}

/// Encode the whole evaluation set and score recall@N.
///
/// The model should be an inference module; no gradients are tracked.
pub fn evaluate<B, M, D>(
    config: &EvalConfig,
    eval_set: Arc<D>,
    model: &M,
    device: &B::Device,
) -> anyhow::Result<RecallReport>
where
    B: Backend,
    M: PlaceModel<B>,
    D: PlaceDataset + ?Sized + 'static,
{
    let db = eval_set.db_struct();
    let total = eval_set.len();
    if db.total() != total {
        anyhow::bail!(
            "dataset metadata describes {} samples ({} gallery + {} queries) but the dataset has {total}",
            db.total(),
            db.num_gallery,
            db.num_queries
        );
    }
    let positives = eval_set.positives()?;

    tracing::debug!(
        gallery = db.num_gallery,
        queries = db.num_queries,
        "Extracting features"
    );
    let settings = ExtractionSettings {
        batch_size: config.cache_batch_size,
        num_workers: config.num_workers,
        dim: config.features_dim(),
    };
    let features = extract_descriptors(
        model,
        eval_set,
        (0..total).collect(),
        total,
        &settings,
        device,
        "Extracting features",
    )?;

    let report = recall_from_descriptors::<B>(
        &config.n_values,
        config.index_on_device,
        &features,
        db,
        &positives,
        device,
    )?;
    tracing::info!(recalls = %report.formatted, "Recalls");
    Ok(report)
}

/// Score precomputed descriptors: rows `[0, num_gallery)` are the gallery,
/// the rest are queries in ground-truth order.
pub fn recall_from_descriptors<B: Backend>(
    n_values: &[usize],
    index_on_device: bool,
    features: &DescriptorMatrix,
    db: DbStruct,
    positives: &[Vec<usize>],
    device: &B::Device,
) -> anyhow::Result<RecallReport> {
    if features.rows() != db.total() {
        anyhow::bail!(
            "descriptor matrix has {} rows, expected {} gallery + {} queries",
            features.rows(),
            db.num_gallery,
            db.num_queries
        );
    }
    let (gallery, queries) = features.split_rows(db.num_gallery)?;
    let depth = n_values.iter().copied().max().unwrap_or(0);

    tracing::debug!(k = depth, on_device = index_on_device, "Calculating recalls");
    let predictions = if index_on_device {
        let mut index = TensorFlatL2Index::<B>::new(features.dim(), device);
        index.add(gallery)?;
        index.search(queries, depth)?
    } else {
        let mut index = FlatL2Index::new(features.dim());
        index.add(gallery)?;
        index.search(queries, depth)?
    };

    compute_recalls(&predictions, positives, n_values, db.num_queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_eval_config_defaults() {
        let cfg = EvalConfig::new();
        assert_eq!(cfg.n_values, vec![1, 5, 10, 20]);
        assert_eq!(cfg.search_depth(), 20);
        assert_eq!(cfg.features_dim(), 512 * 64);
        assert!(!cfg.index_on_device);
    }

    #[test]
    fn test_recall_from_descriptors() {
        // Gallery at x = 0..4; query q sits next to gallery q.
        let mut data: Vec<f32> = (0..4).flat_map(|i| [i as f32 * 10.0, 0.0]).collect();
        data.extend([0.5, 0.0, 10.5, 0.0, 29.0, 0.0]);
        let features = DescriptorMatrix::from_vec(data, 7, 2).unwrap();
        let db = DbStruct {
            num_gallery: 4,
            num_queries: 3,
        };
        // Third query's true match is gallery 0, which ranks last of four.
        let positives = vec![vec![0], vec![1], vec![0]];

        for on_device in [false, true] {
            let report = recall_from_descriptors::<TestBackend>(
                &[1, 2, 4],
                on_device,
                &features,
                db,
                &positives,
                &Default::default(),
            )
            .unwrap();
            assert!((report.recall_at(1).unwrap() - 2.0 / 3.0).abs() < 1e-12);
            assert!((report.recall_at(2).unwrap() - 2.0 / 3.0).abs() < 1e-12);
            assert!((report.recall_at(4).unwrap() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_row_count_mismatch() {
        let features = DescriptorMatrix::zeros(3, 2);
        let db = DbStruct {
            num_gallery: 2,
            num_queries: 2,
        };
        let result = recall_from_descriptors::<TestBackend>(
            &[1],
            false,
            &features,
            db,
            &[vec![0], vec![1]],
            &Default::default(),
        );
        assert!(result.is_err());
    }
}
