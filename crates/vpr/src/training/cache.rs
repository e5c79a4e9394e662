//! Feature cache rebuild for hard-negative mining.
//!
//! Before every sub-iteration the trainer recomputes descriptors for the
//! sub-iteration's queries and for the whole gallery, and overwrites
//! `<output_folder>/cache.parquet` (or `cache.hdf5`). The triplet dataset mines
//! negatives from that file, so the cache must be complete before the triplet
//! loader starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::prelude::*;
use feature_store::{CacheFormat, DescriptorMatrix};

use crate::data::PlaceDataset;
use crate::extract::{extract_descriptors, ExtractionSettings};
use crate::model::PlaceModel;

/// Location of the feature cache inside an output folder.
pub fn cache_path(output_folder: &Path, format: CacheFormat) -> PathBuf {
    output_folder.join(format.file_name())
}

/// Dataset rows to encode: the useful queries (shifted past the gallery),
/// followed by every gallery row.
pub fn useful_indices(useful_queries: &[usize], num_gallery: usize) -> Vec<usize> {
    useful_queries
        .iter()
        .map(|&q| q + num_gallery)
        .chain(0..num_gallery)
        .collect()
}

/// Rebuild and persist the feature cache.
///
/// Returns the freshly written matrix. Any previous cache file is
/// overwritten, never merged: rows outside this call's useful set are zero.
pub fn build_cache<B, M, D>(
    model: &M,
    whole_train_set: Arc<D>,
    useful_queries: &[usize],
    settings: &ExtractionSettings,
    output_folder: &Path,
    format: CacheFormat,
    device: &B::Device,
) -> anyhow::Result<DescriptorMatrix>
where
    B: Backend,
    M: PlaceModel<B>,
    D: PlaceDataset + ?Sized + 'static,
{
    let db = whole_train_set.db_struct();
    let total_rows = whole_train_set.len();
    let indices = useful_indices(useful_queries, db.num_gallery);
    if let Some(&bad) = indices.iter().find(|&&i| i >= total_rows) {
        anyhow::bail!("cache index {bad} out of range for training set of {total_rows} samples");
    }

    tracing::debug!(
        queries = useful_queries.len(),
        gallery = db.num_gallery,
        rows = total_rows,
        "Building feature cache"
    );

    let matrix = extract_descriptors(
        model,
        whole_train_set,
        indices,
        total_rows,
        settings,
        device,
        "Building cache",
    )?;

    std::fs::create_dir_all(output_folder)?;
    let path = cache_path(output_folder, format);
    format
        .write(&path, &matrix)
        .map_err(|e| anyhow::anyhow!("Failed to write feature cache {}: {e}", path.display()))?;

    Ok(matrix)
}
