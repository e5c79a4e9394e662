//! Gradient reversal for the domain-adversarial head.

use burn::prelude::*;

/// Identity in the forward pass; multiplies the incoming gradient by
/// `-lambda` in the backward pass.
///
/// Place it between the descriptor trunk and the domain classifier so that
/// minimizing the domain loss pushes the trunk toward domain-invariant
/// features.
pub fn grad_reverse<B: Backend, const D: usize>(x: Tensor<B, D>, lambda: f64) -> Tensor<B, D> {
    let detached = x.clone().detach();
    // (x - detached) is exactly zero, so the value is x; only its gradient flows.
    detached.clone() + (x - detached).mul_scalar(-lambda)
}
