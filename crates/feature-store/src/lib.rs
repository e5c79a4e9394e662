//! Dense descriptor storage for place-recognition training.
//!
//! Provides the row-major [`DescriptorMatrix`] shared by the cache builder and
//! the retrieval evaluator, and I/O for the on-disk feature cache that the
//! negative-mining sampler reads between cache refreshes. Parquet is always
//! available; HDF5 sits behind the `hdf5` feature.

pub mod format;
#[cfg(feature = "hdf5")]
pub mod h5;
pub mod matrix;
pub mod reader;
pub mod writer;

pub use format::{read_cache_file, CacheFormat, HDF5_CACHE_FILE_NAME};
pub use matrix::{DescriptorMatrix, DescriptorRows};
pub use reader::{read_cache, read_summary, CacheSummary};
pub use writer::{cache_schema, write_cache, CACHE_COLUMN, CACHE_FILE_NAME};
