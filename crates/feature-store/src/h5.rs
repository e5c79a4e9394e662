//! HDF5 feature caches: one float32 dataset named `cache` of shape `[N, D]`.

use std::path::Path;

use crate::matrix::DescriptorMatrix;
use crate::writer::CACHE_COLUMN;

/// Write `matrix` to `path`, truncating any existing file.
pub fn write_cache_hdf5(path: &Path, matrix: &DescriptorMatrix) -> anyhow::Result<()> {
    let file = hdf5::File::create(path)?;
    let dataset = file
        .new_dataset::<f32>()
        .shape((matrix.rows(), matrix.dim()))
        .create(CACHE_COLUMN)?;
    if !matrix.as_slice().is_empty() {
        dataset.write_raw(matrix.as_slice())?;
    }

    tracing::debug!(
        rows = matrix.rows(),
        dim = matrix.dim(),
        path = %path.display(),
        "Wrote HDF5 feature cache"
    );
    Ok(())
}

pub fn read_cache_hdf5(path: &Path) -> anyhow::Result<DescriptorMatrix> {
    let file = hdf5::File::open(path)?;
    let dataset = file.dataset(CACHE_COLUMN)?;
    let shape = dataset.shape();
    let &[rows, dim] = shape.as_slice() else {
        anyhow::bail!("dataset `{CACHE_COLUMN}` has shape {shape:?}, expected [N, D]");
    };
    let values = if rows * dim == 0 {
        Vec::new()
    } else {
        dataset.read_raw::<f32>()?
    };
    tracing::debug!(rows, dim, path = %path.display(), "Read HDF5 feature cache");
    DescriptorMatrix::from_vec(values, rows, dim)
}
