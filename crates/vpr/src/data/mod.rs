//! Dataset interfaces, collation, and background loaders.

pub mod collate;
pub mod domain;
pub mod loader;
pub mod types;

pub use collate::{collate_triplets, NegativeOffsets, TripletBatch, Triplets};
pub use domain::{DomainBatch, DomainBatches};
pub use loader::{image_loader, triplet_loader, BatchLoader};
pub use types::{
    DbStruct, DomainDataset, Image, ImageBatch, ImageDataset, IndexedBatch, PlaceDataset,
    TripletDataset, TripletSample,
};
