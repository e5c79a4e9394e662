//! Per-epoch random partition of the query set into cache-refresh subsets.

use rand::seq::SliceRandom;
use rand::Rng;

/// Disjoint chunks of query indices, one per cache refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetPartition {
    chunks: Vec<Vec<usize>>,
}

impl SubsetPartition {
    /// `ceil(num_queries / (cache_refresh_rate * epoch_divider))`.
    pub fn subset_count(num_queries: usize, cache_refresh_rate: usize, epoch_divider: usize) -> usize {
        let per_subset = cache_refresh_rate * epoch_divider;
        if per_subset == 0 {
            return 0;
        }
        num_queries.div_ceil(per_subset)
    }

    /// Permute `[0, num_queries)` and split into [`subset_count`](Self::subset_count) chunks.
    pub fn random(
        num_queries: usize,
        cache_refresh_rate: usize,
        epoch_divider: usize,
        rng: &mut impl Rng,
    ) -> anyhow::Result<Self> {
        if cache_refresh_rate == 0 || epoch_divider == 0 {
            anyhow::bail!("cache_refresh_rate and epoch_divider must be positive");
        }
        let mut order: Vec<usize> = (0..num_queries).collect();
        order.shuffle(rng);
        let subset_num = Self::subset_count(num_queries, cache_refresh_rate, epoch_divider);
        Ok(Self::split(order, subset_num))
    }

    /// Split `order` into `n` contiguous chunks whose sizes differ by at most
    /// one, larger chunks first.
    pub fn split(order: Vec<usize>, n: usize) -> Self {
        if n == 0 {
            return Self { chunks: Vec::new() };
        }
        let base = order.len() / n;
        let extra = order.len() % n;
        let mut chunks = Vec::with_capacity(n);
        let mut rest = order.as_slice();
        for i in 0..n {
            let size = base + usize::from(i < extra);
            let (head, tail) = rest.split_at(size);
            chunks.push(head.to_vec());
            rest = tail;
        }
        Self { chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Vec<usize>] {
        &self.chunks
    }

    /// The first `cap` indices of chunk `i`: the queries actually cached and
    /// trained on in that sub-iteration.
    pub fn useful(&self, i: usize, cap: usize) -> &[usize] {
        let chunk = &self.chunks[i];
        &chunk[..chunk.len().min(cap)]
    }
}
