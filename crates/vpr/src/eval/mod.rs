pub mod evaluator;
pub mod index;
pub mod recall;

pub use evaluator::{evaluate, recall_from_descriptors, EvalConfig};
pub use index::{FlatL2Index, NearestNeighborIndex, TensorFlatL2Index};
pub use recall::{compute_recalls, correct_at_n, format_recalls, RecallReport, DEFAULT_N_VALUES};
