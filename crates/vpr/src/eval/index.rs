//! Exact L2 nearest-neighbour search over gallery descriptors.
//!
//! [`FlatL2Index`] scans on the host with one rayon task per query.
//! [`TensorFlatL2Index`] keeps the gallery on a burn device and ranks whole
//! query blocks with a matmul.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use burn::prelude::*;
use burn::tensor::TensorData;
use feature_store::DescriptorRows;
use rayon::prelude::*;

/// Query blocks for the device index, bounding the `(block, gallery)` distance matrix.
const QUERY_BLOCK: usize = 1024;

/// Flat (exhaustive) index: results are exact.
pub trait NearestNeighborIndex {
    fn dim(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append rows; their ids continue from the current length.
    fn add(&mut self, rows: DescriptorRows<'_>) -> anyhow::Result<()>;

    /// Ids of the `k` nearest rows per query by ascending squared L2 distance.
    ///
    /// Returns fewer than `k` ids when the index holds fewer rows.
    fn search(&self, queries: DescriptorRows<'_>, k: usize) -> anyhow::Result<Vec<Vec<usize>>>;
}

fn check_dim(expected: usize, got: usize) -> anyhow::Result<()> {
    if expected != got {
        anyhow::bail!("descriptor dimension {got} does not match index dimension {expected}");
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct Scored {
    id: usize,
    distance: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // Max-heap on (distance, id): the root is the current worst candidate, and
    // among equal distances the larger id is evicted first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Host-side exact index.
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dim: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    fn row(&self, id: usize) -> &[f32] {
        &self.data[id * self.dim..(id + 1) * self.dim]
    }

    fn top_k(&self, query: &[f32], k: usize) -> Vec<usize> {
        let k = k.min(self.len());
        let mut heap: BinaryHeap<Scored> = BinaryHeap::with_capacity(k + 1);
        for id in 0..self.len() {
            let candidate = Scored {
                id,
                distance: squared_l2(query, self.row(id)),
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }
        heap.into_sorted_vec().into_iter().map(|s| s.id).collect()
    }
}

impl NearestNeighborIndex for FlatL2Index {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn add(&mut self, rows: DescriptorRows<'_>) -> anyhow::Result<()> {
        check_dim(self.dim, rows.dim())?;
        self.data.extend_from_slice(rows.as_slice());
        Ok(())
    }

    fn search(&self, queries: DescriptorRows<'_>, k: usize) -> anyhow::Result<Vec<Vec<usize>>> {
        check_dim(self.dim, queries.dim())?;
        if k == 0 {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        Ok((0..queries.len())
            .into_par_iter()
            .map(|q| self.top_k(queries.row(q), k))
            .collect())
    }
}

/// Device-resident exact index.
///
/// Distances are expanded as `|q|^2 - 2 q.g + |g|^2`, so near-ties may rank
/// differently from [`FlatL2Index`].
pub struct TensorFlatL2Index<B: Backend> {
    dim: usize,
    gallery: Option<Tensor<B, 2>>,
    device: B::Device,
}

impl<B: Backend> TensorFlatL2Index<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            dim,
            gallery: None,
            device: device.clone(),
        }
    }

    fn upload(&self, rows: DescriptorRows<'_>) -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(rows.as_slice().to_vec(), [rows.len(), rows.dim()]),
            &self.device,
        )
    }

    fn search_block(
        &self,
        gallery: &Tensor<B, 2>,
        gallery_norms: &Tensor<B, 2>,
        block: DescriptorRows<'_>,
        k: usize,
    ) -> anyhow::Result<Vec<Vec<usize>>> {
        let m = block.len();
        let q = self.upload(block);
        let q_norms = q.clone().powf_scalar(2.0).sum_dim(1);
        let cross = q.matmul(gallery.clone().transpose()).mul_scalar(2.0);
        let distances = q_norms - cross + gallery_norms.clone();

        let (_, order) = distances.sort_with_indices(1);
        let n = gallery.dims()[0];
        let ids = order
            .slice([0..m, 0..k.min(n)])
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("failed to read neighbour ids from device: {e:?}"))?;

        let width = k.min(n);
        Ok(ids
            .chunks(width.max(1))
            .take(m)
            .map(|row| row.iter().map(|&id| id as usize).collect())
            .collect())
    }
}

impl<B: Backend> NearestNeighborIndex for TensorFlatL2Index<B> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.gallery.as_ref().map_or(0, |g| g.dims()[0])
    }

    fn add(&mut self, rows: DescriptorRows<'_>) -> anyhow::Result<()> {
        check_dim(self.dim, rows.dim())?;
        if rows.is_empty() {
            return Ok(());
        }
        let block = self.upload(rows);
        self.gallery = Some(match self.gallery.take() {
            Some(existing) => Tensor::cat(vec![existing, block], 0),
            None => block,
        });
        Ok(())
    }

    fn search(&self, queries: DescriptorRows<'_>, k: usize) -> anyhow::Result<Vec<Vec<usize>>> {
        check_dim(self.dim, queries.dim())?;
        let gallery = match &self.gallery {
            Some(g) if k > 0 => g,
            _ => return Ok(vec![Vec::new(); queries.len()]),
        };
        let gallery_norms = gallery.clone().powf_scalar(2.0).sum_dim(1).transpose();

        let mut results = Vec::with_capacity(queries.len());
        for block in queries.as_slice().chunks(QUERY_BLOCK * self.dim) {
            let block = DescriptorRows::new(block, self.dim)?;
            results.extend(self.search_block(gallery, &gallery_norms, block, k)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn gallery() -> Vec<f32> {
        // Points on a line at x = 0, 1, 2, ..., 5.
        (0..6).flat_map(|i| [i as f32, 0.0]).collect()
    }

    #[test]
    fn test_flat_orders_by_distance() {
        let g = gallery();
        let mut index = FlatL2Index::new(2);
        index.add(DescriptorRows::new(&g, 2).unwrap()).unwrap();
        assert_eq!(index.len(), 6);

        let q = [3.9_f32, 0.0, 0.2, 0.0];
        let result = index.search(DescriptorRows::new(&q, 2).unwrap(), 3).unwrap();
        assert_eq!(result, vec![vec![4, 3, 5], vec![0, 1, 2]]);
    }

    #[test]
    fn test_flat_ties_in_index_order() {
        let g = [1.0_f32, 0.0, -1.0, 0.0, 1.0, 0.0];
        let mut index = FlatL2Index::new(2);
        index.add(DescriptorRows::new(&g, 2).unwrap()).unwrap();

        let q = [0.0_f32, 0.0];
        let result = index.search(DescriptorRows::new(&q, 2).unwrap(), 2).unwrap();
        assert_eq!(result, vec![vec![0, 1]]);
    }

    #[test]
    fn test_k_larger_than_gallery() {
        let g = [0.0_f32, 0.0, 5.0, 5.0];
        let mut index = FlatL2Index::new(2);
        index.add(DescriptorRows::new(&g, 2).unwrap()).unwrap();
        let q = [4.0_f32, 4.0];
        let result = index.search(DescriptorRows::new(&q, 2).unwrap(), 20).unwrap();
        assert_eq!(result, vec![vec![1, 0]]);
    }

    #[test]
    fn test_huge_cutoff_returns_whole_gallery() {
        let g = gallery();
        let mut index = FlatL2Index::new(2);
        index.add(DescriptorRows::new(&g, 2).unwrap()).unwrap();
        let q = [5.0_f32, 0.0];
        let result = index.search(DescriptorRows::new(&q, 2).unwrap(), usize::MAX).unwrap();
        assert_eq!(result, vec![vec![5, 4, 3, 2, 1, 0]]);
    }

    #[test]
    fn test_dim_mismatch() {
        let mut index = FlatL2Index::new(3);
        let g = [0.0_f32; 4];
        assert!(index.add(DescriptorRows::new(&g, 2).unwrap()).is_err());
    }

    #[test]
    fn test_device_index_matches_host() {
        let device = Default::default();
        let g = gallery();
        let q = [3.9_f32, 0.1, 0.2, -0.3, 5.6, 1.0];

        let mut host = FlatL2Index::new(2);
        host.add(DescriptorRows::new(&g, 2).unwrap()).unwrap();
        let mut dev = TensorFlatL2Index::<TestBackend>::new(2, &device);
        dev.add(DescriptorRows::new(&g[..6], 2).unwrap()).unwrap();
        dev.add(DescriptorRows::new(&g[6..], 2).unwrap()).unwrap();
        assert_eq!(dev.len(), 6);

        let queries = DescriptorRows::new(&q, 2).unwrap();
        assert_eq!(
            dev.search(queries, 4).unwrap(),
            host.search(queries, 4).unwrap()
        );
    }

    #[test]
    fn test_device_index_empty_gallery() {
        let device = Default::default();
        let dev = TensorFlatL2Index::<TestBackend>::new(2, &device);
        let q = [1.0_f32, 2.0];
        let result = dev.search(DescriptorRows::new(&q, 2).unwrap(), 5).unwrap();
        assert_eq!(result, vec![Vec::<usize>::new()]);
    }
}
