//! Choice of on-disk layout for the feature cache.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::matrix::DescriptorMatrix;
use crate::reader::read_cache;
use crate::writer::{write_cache, CACHE_FILE_NAME};

/// File name of an HDF5 feature cache inside the run's output folder.
pub const HDF5_CACHE_FILE_NAME: &str = "cache.hdf5";

/// Container used for the feature cache.
///
/// Both hold the same `[N, D]` float32 matrix under the name `cache`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheFormat {
    /// One `List<Float32>` column, one row per sample.
    #[default]
    Parquet,
    /// One 2-D float32 dataset. Needs the `hdf5` feature.
    Hdf5,
}

impl CacheFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Parquet => CACHE_FILE_NAME,
            Self::Hdf5 => HDF5_CACHE_FILE_NAME,
        }
    }

    /// `.h5` and `.hdf5` files are HDF5; anything else is read as Parquet.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("h5" | "hdf5") => Self::Hdf5,
            _ => Self::Parquet,
        }
    }

    /// Write `matrix` to `path`, truncating any existing file.
    pub fn write(self, path: &Path, matrix: &DescriptorMatrix) -> anyhow::Result<()> {
        match self {
            Self::Parquet => write_cache(path, matrix),
            #[cfg(feature = "hdf5")]
            Self::Hdf5 => crate::h5::write_cache_hdf5(path, matrix),
            #[cfg(not(feature = "hdf5"))]
            Self::Hdf5 => Err(missing_hdf5()),
        }
    }

    pub fn read(self, path: &Path) -> anyhow::Result<DescriptorMatrix> {
        match self {
            Self::Parquet => read_cache(path),
            #[cfg(feature = "hdf5")]
            Self::Hdf5 => crate::h5::read_cache_hdf5(path),
            #[cfg(not(feature = "hdf5"))]
            Self::Hdf5 => Err(missing_hdf5()),
        }
    }
}

#[cfg(not(feature = "hdf5"))]
fn missing_hdf5() -> anyhow::Error {
    anyhow::anyhow!("HDF5 caches need feature-store built with the `hdf5` feature")
}

/// Read a cache file in the format implied by its extension.
pub fn read_cache_file(path: &Path) -> anyhow::Result<DescriptorMatrix> {
    CacheFormat::from_path(path).read(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_names_and_extensions() {
        assert_eq!(CacheFormat::default().file_name(), "cache.parquet");
        assert_eq!(CacheFormat::Hdf5.file_name(), "cache.hdf5");
        assert_eq!(CacheFormat::from_path(Path::new("run/cache.hdf5")), CacheFormat::Hdf5);
        assert_eq!(CacheFormat::from_path(Path::new("feats.h5")), CacheFormat::Hdf5);
        assert_eq!(CacheFormat::from_path(Path::new("run/cache.parquet")), CacheFormat::Parquet);
        assert_eq!(CacheFormat::from_path(Path::new("descriptors")), CacheFormat::Parquet);
    }

    #[test]
    fn test_parquet_dispatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CacheFormat::Parquet.file_name());
        let matrix = DescriptorMatrix::from_vec(vec![1.0, 2.0, 0.0, 0.0], 2, 2).unwrap();
        CacheFormat::Parquet.write(&path, &matrix).unwrap();
        assert_eq!(read_cache_file(&path).unwrap(), matrix);
    }

    #[cfg(not(feature = "hdf5"))]
    #[test]
    fn test_hdf5_without_feature_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(HDF5_CACHE_FILE_NAME);
        let matrix = DescriptorMatrix::zeros(1, 2);
        assert!(CacheFormat::Hdf5.write(&path, &matrix).is_err());
        assert!(!path.exists());
        assert!(read_cache_file(&path).is_err());
    }
}
