//! NetVLAD-style visual place recognition.
//!
//! Trains an embedding model with a triplet margin loss whose negatives are
//! mined from a feature cache rebuilt every `cache_refresh_rate` queries, with
//! an optional domain-adversarial loss. Evaluates with exact L2 retrieval and
//! recall@N. Networks and datasets are supplied by the caller through the
//! [`model::PlaceModel`] and [`data`] traits.

pub mod data;
pub mod eval;
pub mod extract;
pub mod model;
pub mod training;

pub use eval::{evaluate, EvalConfig, RecallReport};
pub use extract::{extract_descriptors, ExtractionSettings};
pub use model::{ForwardHead, PlaceModel};
pub use training::{train_epoch, EpochReport, LossDenominator, TrainConfig};
