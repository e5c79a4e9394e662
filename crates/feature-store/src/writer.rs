//! Writes a [`DescriptorMatrix`] as a Parquet feature cache.

use std::path::Path;
use std::sync::Arc;

use arrow::array::*;
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use crate::matrix::DescriptorMatrix;

/// File name of the feature cache inside the run's output folder.
pub const CACHE_FILE_NAME: &str = "cache.parquet";

/// Name of the single descriptor column.
pub const CACHE_COLUMN: &str = "cache";

/// Rows per Arrow record batch when writing.
const ROWS_PER_BATCH: usize = 4096;

/// Arrow schema for cache files: one `List<Float32>` column, one row per sample.
pub fn cache_schema() -> Schema {
    Schema::new(vec![Field::new(
        CACHE_COLUMN,
        DataType::List(Arc::new(Field::new("item", DataType::Float32, false))),
        false,
    )])
}

/// Write `matrix` to `path`, truncating any existing file.
///
/// The whole matrix is written, including all-zero rows, so row `i` of the
/// file is always sample `i`.
pub fn write_cache(path: &Path, matrix: &DescriptorMatrix) -> anyhow::Result<()> {
    let schema = Arc::new(cache_schema());

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), None)?;

    if matrix.rows() == 0 {
        writer.write(&RecordBatch::new_empty(schema))?;
    } else {
        let dim = matrix.dim();
        let mut start = 0;
        while start < matrix.rows() {
            let end = (start + ROWS_PER_BATCH).min(matrix.rows());
            let chunk = &matrix.as_slice()[start * dim..end * dim];
            let batch = build_record_batch(schema.clone(), chunk, end - start, dim)?;
            writer.write(&batch)?;
            start = end;
        }
    }
    writer.close()?;

    tracing::debug!(
        rows = matrix.rows(),
        dim = matrix.dim(),
        path = %path.display(),
        "Wrote feature cache"
    );

    Ok(())
}

fn build_record_batch(
    schema: Arc<Schema>,
    values: &[f32],
    rows: usize,
    dim: usize,
) -> anyhow::Result<RecordBatch> {
    let offsets: Vec<i32> = (0..=rows)
        .map(|r| i32::try_from(r * dim))
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("cache chunk too large for i32 list offsets"))?;

    let list_array = ListArray::new(
        Arc::new(Field::new("item", DataType::Float32, false)),
        OffsetBuffer::new(offsets.into()),
        Arc::new(Float32Array::from(values.to_vec())),
        None,
    );

    Ok(RecordBatch::try_new(schema, vec![Arc::new(list_array)])?)
}
