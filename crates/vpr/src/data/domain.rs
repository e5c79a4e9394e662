//! Endless source of domain-labelled batches for adversarial training.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::loader::BatchLoader;
use super::types::{DomainDataset, ImageBatch};
use crate::training::TrainConfig;

/// Images with their domain labels.
#[derive(Debug, Clone)]
pub struct DomainBatch {
    pub images: ImageBatch,
    pub labels: Vec<usize>,
}

/// Cycling, shuffled loader over a [`DomainDataset`].
///
/// Each pass visits every sample once in a fresh random order. When a pass
/// runs out, the next call starts a new pass, so [`next_batch`](Self::next_batch)
/// never runs dry.
pub struct DomainBatches {
    dataset: Arc<dyn DomainDataset>,
    batch_size: usize,
    num_workers: usize,
    rng: StdRng,
    current: Option<BatchLoader<DomainBatch>>,
    passes: usize,
}

impl DomainBatches {
    /// # Errors
    /// Returns an error if the dataset is empty or `batch_size` is zero.
    pub fn new(
        dataset: Arc<dyn DomainDataset>,
        batch_size: usize,
        num_workers: usize,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        if dataset.is_empty() {
            anyhow::bail!("domain dataset is empty; adversarial training needs at least one sample");
        }
        if batch_size == 0 {
            anyhow::bail!("domain batch size must be positive");
        }
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            dataset,
            batch_size,
            num_workers,
            rng,
            current: None,
            passes: 0,
        })
    }

    /// Loader sized by `grl_batch_size`, sharing the trainer's workers and seed.
    pub fn from_config(dataset: Arc<dyn DomainDataset>, config: &TrainConfig) -> anyhow::Result<Self> {
        Self::new(dataset, config.grl_batch_size, config.num_workers, config.seed)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Completed or started passes over the dataset.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Next batch, restarting with a reshuffled pass when exhausted.
    pub fn next_batch(&mut self) -> anyhow::Result<DomainBatch> {
        for _ in 0..2 {
            if self.current.is_none() {
                self.current = Some(self.start_pass());
            }
            if let Some(loader) = self.current.as_mut() {
                if let Some(batch) = loader.next() {
                    return batch;
                }
            }
            self.current = None;
        }
        anyhow::bail!("domain loader produced no batch from a fresh pass")
    }

    fn start_pass(&mut self) -> BatchLoader<DomainBatch> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        order.shuffle(&mut self.rng);
        self.passes += 1;
        tracing::debug!(pass = self.passes, samples = order.len(), "Starting domain pass");

        let dataset = self.dataset.clone();
        let fetch = move |chunk: &[usize]| -> anyhow::Result<DomainBatch> {
            let mut images = Vec::with_capacity(chunk.len());
            let mut labels = Vec::with_capacity(chunk.len());
            for &i in chunk {
                let (image, label) = dataset.sample(i)?;
                images.push(image);
                labels.push(label);
            }
            Ok(DomainBatch {
                images: ImageBatch::stack(images)?,
                labels,
            })
        };
        BatchLoader::new(order, self.batch_size, self.num_workers, Arc::new(fetch))
    }
}
