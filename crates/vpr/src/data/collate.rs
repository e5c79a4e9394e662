//! Triplet batch collation and the per-batch negative offset table.

use std::ops::Range;

use super::types::{ImageBatch, TripletSample};

/// Collated triplets with a variable number of negatives per query.
///
/// `query` and `positives` are aligned one-to-one. `negatives` is the flat
/// concatenation of every query's negatives; `neg_counts[i]` says how many
/// belong to query `i`.
#[derive(Debug, Clone)]
pub struct Triplets {
    pub query: ImageBatch,
    pub positives: ImageBatch,
    pub negatives: ImageBatch,
    pub neg_counts: Vec<usize>,
    pub indices: Vec<usize>,
}

impl Triplets {
    pub fn batch_size(&self) -> usize {
        self.query.len()
    }

    pub fn offsets(&self) -> NegativeOffsets {
        NegativeOffsets::new(&self.neg_counts)
    }
}

/// A loader batch: either usable triplets or nothing at all.
#[derive(Debug, Clone)]
pub enum TripletBatch {
    Valid(Triplets),
    /// Every sample in the chunk was invalid.
    Empty,
}

/// Drop invalid samples and stack the rest.
pub fn collate_triplets(samples: Vec<Option<TripletSample>>) -> anyhow::Result<TripletBatch> {
    let samples: Vec<TripletSample> = samples.into_iter().flatten().collect();
    if samples.is_empty() {
        return Ok(TripletBatch::Empty);
    }

    let image_shape = samples[0].query.shape();
    let mut queries = Vec::with_capacity(samples.len());
    let mut positives = Vec::with_capacity(samples.len());
    let mut negatives = Vec::new();
    let mut neg_counts = Vec::with_capacity(samples.len());
    let mut indices = Vec::with_capacity(samples.len());

    for sample in samples {
        neg_counts.push(sample.negatives.len());
        indices.push(sample.index);
        queries.push(sample.query);
        positives.push(sample.positive);
        negatives.extend(sample.negatives);
    }

    let negatives = if negatives.is_empty() {
        ImageBatch::empty(image_shape)
    } else {
        ImageBatch::stack(negatives)?
    };

    Ok(TripletBatch::Valid(Triplets {
        query: ImageBatch::stack(queries)?,
        positives: ImageBatch::stack(positives)?,
        negatives,
        neg_counts,
        indices,
    }))
}

/// Prefix-sum table locating each query's negatives in the flat block.
///
/// Built once per batch; negative `n` of query `i` sits at
/// `start(i) + n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegativeOffsets {
    starts: Vec<usize>,
    counts: Vec<usize>,
    total: usize,
}

impl NegativeOffsets {
    pub fn new(neg_counts: &[usize]) -> Self {
        let mut starts = Vec::with_capacity(neg_counts.len());
        let mut total = 0;
        for &count in neg_counts {
            starts.push(total);
            total += count;
        }
        Self {
            starts,
            counts: neg_counts.to_vec(),
            total,
        }
    }

    /// Total negatives in the batch (`n_neg`).
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn num_queries(&self) -> usize {
        self.counts.len()
    }

    /// Rows of the negatives block belonging to query `i`.
    pub fn range(&self, i: usize) -> Range<usize> {
        self.starts[i]..self.starts[i] + self.counts[i]
    }

    /// Every `(query, negative_row)` pair, query-major.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.counts.len()).flat_map(move |i| self.range(i).map(move |n| (i, n)))
    }
}
