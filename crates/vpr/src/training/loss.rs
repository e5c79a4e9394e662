//! Triplet margin loss over variable-negative batches, plus the domain loss.
//!
//! A forward pass encodes `[query; positives; negatives]` in one go. The
//! encoding is then split into three blocks and every (query, negative) pair
//! contributes one triplet term. The summed loss is divided by the total
//! number of negatives in the batch.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;

use crate::data::NegativeOffsets;

/// A loss over `(anchor, positive, negative)` rows.
///
/// Inputs are `(n, dim)`; the output is a one-element tensor.
pub trait TripletCriterion<B: Backend> {
    fn forward(
        &self,
        anchor: Tensor<B, 2>,
        positive: Tensor<B, 2>,
        negative: Tensor<B, 2>,
    ) -> Tensor<B, 1>;
}

#[derive(Config, Debug)]
pub struct TripletMarginLossConfig {
    #[config(default = 0.1)]
    pub margin: f64,
    /// Norm degree of the pairwise distance.
    #[config(default = 2.0)]
    pub p: f64,
    /// Added to the difference before taking the norm.
    #[config(default = 1e-6)]
    pub eps: f64,
}

impl TripletMarginLossConfig {
    pub fn init(&self) -> TripletMarginLoss {
        TripletMarginLoss {
            margin: self.margin,
            p: self.p,
            eps: self.eps,
        }
    }
}

/// `mean(max(d(a, p) - d(a, n) + margin, 0))` with `d(x, y) = ||x - y + eps||_p`.
#[derive(Debug, Clone)]
pub struct TripletMarginLoss {
    pub margin: f64,
    pub p: f64,
    pub eps: f64,
}

impl TripletMarginLoss {
    fn distance<B: Backend>(&self, x1: Tensor<B, 2>, x2: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = x1.dims();
        (x1 - x2)
            .add_scalar(self.eps)
            .abs()
            .powf_scalar(self.p)
            .sum_dim(1)
            .powf_scalar(1.0 / self.p)
            .reshape([n])
    }
}

impl<B: Backend> TripletCriterion<B> for TripletMarginLoss {
    fn forward(
        &self,
        anchor: Tensor<B, 2>,
        positive: Tensor<B, 2>,
        negative: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let d_ap = self.distance(anchor.clone(), positive);
        let d_an = self.distance(anchor, negative);
        (d_ap - d_an).add_scalar(self.margin).clamp_min(0.0).mean()
    }
}

/// Split a stacked encoding into its query, positive and negative blocks.
pub fn split_embeddings<B: Backend>(
    encoding: Tensor<B, 2>,
    batch_size: usize,
    num_negatives: usize,
) -> anyhow::Result<(Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>)> {
    let [rows, dim] = encoding.dims();
    let expected = 2 * batch_size + num_negatives;
    if rows != expected {
        anyhow::bail!(
            "encoding has {rows} rows, expected {expected} ({batch_size} queries, {batch_size} positives, {num_negatives} negatives)"
        );
    }
    let b = batch_size;
    let q = encoding.clone().slice([0..b, 0..dim]);
    let p = encoding.clone().slice([b..2 * b, 0..dim]);
    let n = encoding.slice([2 * b..expected, 0..dim]);
    Ok((q, p, n))
}

/// Sum the criterion over every (query, negative) pair, one term per pair.
pub fn triplet_loss_sum<B: Backend, C: TripletCriterion<B>>(
    criterion: &C,
    queries: Tensor<B, 2>,
    positives: Tensor<B, 2>,
    negatives: Tensor<B, 2>,
    offsets: &NegativeOffsets,
) -> Tensor<B, 1> {
    let [_, dim] = queries.dims();
    let terms: Vec<Tensor<B, 1>> = offsets
        .triplets()
        .map(|(i, n)| {
            criterion.forward(
                queries.clone().slice([i..i + 1, 0..dim]),
                positives.clone().slice([i..i + 1, 0..dim]),
                negatives.clone().slice([n..n + 1, 0..dim]),
            )
        })
        .collect();
    if terms.is_empty() {
        return Tensor::zeros([1], &queries.device());
    }
    Tensor::cat(terms, 0).sum()
}

pub fn normalize_by_negatives<B: Backend>(sum: Tensor<B, 1>, num_negatives: usize) -> Tensor<B, 1> {
    sum.div_scalar(num_negatives as f64)
}

/// Batch triplet loss: per-triplet sum divided by the number of negatives.
///
/// # Errors
/// Returns an error if the batch has no negatives or the encoding shape does
/// not match `offsets`.
pub fn triplet_loss<B: Backend, C: TripletCriterion<B>>(
    criterion: &C,
    encoding: Tensor<B, 2>,
    batch_size: usize,
    offsets: &NegativeOffsets,
) -> anyhow::Result<Tensor<B, 1>> {
    let n_neg = offsets.total();
    if n_neg == 0 {
        anyhow::bail!("triplet batch has no negatives");
    }
    if offsets.num_queries() != batch_size {
        anyhow::bail!(
            "negative counts cover {} queries, batch has {batch_size}",
            offsets.num_queries()
        );
    }
    let (q, p, n) = split_embeddings(encoding, batch_size, n_neg)?;
    let sum = triplet_loss_sum(criterion, q, p, n, offsets);
    Ok(normalize_by_negatives(sum, n_neg))
}

/// Cross-entropy of domain logits against integer labels.
pub fn domain_loss<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let device = logits.device();
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, labels)
}
