use burn::prelude::*;

/// Which output a forward pass should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardHead {
    /// Global image descriptor, `(batch, encoder_dim * num_clusters)`.
    Descriptor,
    /// Domain-classifier logits behind a gradient-reversal layer,
    /// `(batch, num_domains)`.
    Domain,
}

/// An embedding model the trainer and evaluator can drive.
///
/// Implemented by the caller's network (backbone + NetVLAD pooling + optional
/// domain head). The trainer needs it on an autodiff backend and, through
/// [`burn::module::AutodiffModule::valid`], on the inner backend for cache
/// building; the evaluator only needs the inner one.
pub trait PlaceModel<B: Backend>: Module<B> {
    /// Run the model on an NCHW image batch.
    fn forward_head(&self, images: Tensor<B, 4>, head: ForwardHead) -> Tensor<B, 2>;

    fn descriptors(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_head(images, ForwardHead::Descriptor)
    }

    fn domain_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_head(images, ForwardHead::Domain)
    }
}
