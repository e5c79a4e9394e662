//! Tensor bridge: host-side batches in, host-side descriptors out.
//!
//! Loader workers produce plain `Vec<f32>` buffers; these helpers are the
//! (blocking) transfer points to and from the burn device.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::data::ImageBatch;

/// Upload an NCHW image batch.
pub fn images_to_tensor<B: Backend>(batch: &ImageBatch, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(batch.pixels().to_vec(), batch.shape()), device)
}

/// Upload class labels.
pub fn labels_to_tensor<B: Backend>(labels: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    Tensor::from_data(TensorData::new(values, [labels.len()]), device)
}

/// Download a `(rows, dim)` descriptor block as row-major f32.
///
/// # Errors
/// Returns an error if the tensor does not have the expected shape.
pub fn descriptors_to_vec<B: Backend>(
    descriptors: Tensor<B, 2>,
    rows: usize,
    dim: usize,
) -> anyhow::Result<Vec<f32>> {
    let [got_rows, got_dim] = descriptors.dims();
    if got_rows != rows || got_dim != dim {
        anyhow::bail!(
            "model produced descriptors of shape [{got_rows}, {got_dim}], expected [{rows}, {dim}]"
        );
    }
    descriptors
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read descriptors back from device: {e:?}"))
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
