pub mod bridge;
pub mod grl;
pub mod place_model;

pub use grl::grad_reverse;
pub use place_model::{ForwardHead, PlaceModel};
