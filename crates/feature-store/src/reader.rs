//! Reads Parquet feature caches back into a [`DescriptorMatrix`].

use std::path::Path;

use arrow::array::*;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;

use crate::format::read_cache_file;
use crate::matrix::DescriptorMatrix;

/// Shape statistics of a cache file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub rows: usize,
    pub dim: usize,
    /// Rows that were filled by the last cache build.
    pub nonzero_rows: usize,
}

/// Read a cache file written by [`crate::write_cache`].
///
/// Every row must have the same length.
pub fn read_cache(path: &Path) -> anyhow::Result<DescriptorMatrix> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut values = Vec::new();
    let mut rows = 0usize;
    let mut dim: Option<usize> = None;

    for batch_result in reader {
        let batch = batch_result?;
        let lists = batch
            .column(0)
            .as_any()
            .downcast_ref::<ListArray>()
            .ok_or_else(|| anyhow::anyhow!("Column 0 (cache) is not ListArray"))?;

        for i in 0..batch.num_rows() {
            let row = lists.value(i);
            let floats = row
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| anyhow::anyhow!("List values are not Float32Array"))?;

            match dim {
                None => dim = Some(floats.len()),
                Some(d) if d != floats.len() => {
                    anyhow::bail!(
                        "Dimension mismatch in cache: expected {d}, got {} at row {rows}",
                        floats.len()
                    );
                }
                Some(_) => {}
            }
            values.extend_from_slice(floats.values());
            rows += 1;
        }
    }

    let dim = dim.unwrap_or(0);
    tracing::debug!(rows, dim, path = %path.display(), "Read feature cache");
    DescriptorMatrix::from_vec(values, rows, dim)
}

/// Summarize a cache file without keeping the matrix around.
///
/// The format follows the file extension, see [`crate::CacheFormat::from_path`].
pub fn read_summary(path: &Path) -> anyhow::Result<CacheSummary> {
    let matrix = read_cache_file(path)?;
    Ok(CacheSummary {
        rows: matrix.rows(),
        dim: matrix.dim(),
        nonzero_rows: matrix.nonzero_rows(),
    })
}
