//! No-grad descriptor extraction into a dense, index-addressed matrix.
//!
//! Shared by the cache builder and the evaluator: both run the model over a
//! list of dataset indices and scatter each batch into the rows named by its
//! indices.

use std::sync::Arc;

use burn::prelude::*;
use feature_store::DescriptorMatrix;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{image_loader, ImageDataset};
use crate::model::bridge::{descriptors_to_vec, images_to_tensor};
use crate::model::PlaceModel;

/// Batch shape and parallelism of an extraction pass.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionSettings {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Descriptor dimension the model must produce.
    pub dim: usize,
}

pub(crate) fn progress_bar(len: usize, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}}) {label}"
            ))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Compute descriptors for `indices` into a zeroed `[total_rows, dim]` matrix.
///
/// Rows not listed in `indices` stay zero. The model should be an inference
/// module (no autodiff graph), e.g. the result of `AutodiffModule::valid`.
pub fn extract_descriptors<B, M, D>(
    model: &M,
    dataset: Arc<D>,
    indices: Vec<usize>,
    total_rows: usize,
    settings: &ExtractionSettings,
    device: &B::Device,
    label: &str,
) -> anyhow::Result<DescriptorMatrix>
where
    B: Backend,
    M: PlaceModel<B>,
    D: ImageDataset + ?Sized + 'static,
{
    let mut matrix = DescriptorMatrix::zeros(total_rows, settings.dim);
    let loader = image_loader(dataset, indices, settings.batch_size, settings.num_workers);
    let pb = progress_bar(loader.num_batches(), label);

    for batch in loader {
        let batch = batch?;
        let rows = batch.images.len();
        let encoding = model.descriptors(images_to_tensor::<B>(&batch.images, device));
        let values = descriptors_to_vec(encoding, rows, settings.dim)?;
        matrix.write_rows(&batch.indices, &values)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(matrix)
}
