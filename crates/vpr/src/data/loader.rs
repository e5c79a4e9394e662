//! Background batch loading.
//!
//! A [`BatchLoader`] splits a list of sample indices into fixed-size chunks
//! and hands each chunk to a fetch function. With `num_workers > 0` the fetch
//! runs on worker threads that push finished batches through a bounded
//! channel; the consumer reorders them so batches come out in request order.
//! With `num_workers == 0` batches are fetched inline on the caller's thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver};

use super::collate::{collate_triplets, TripletBatch};
use super::types::{ImageBatch, ImageDataset, IndexedBatch, TripletDataset};

/// Turns one chunk of sample indices into a batch.
pub type FetchFn<T> = dyn Fn(&[usize]) -> anyhow::Result<T> + Send + Sync;

/// Batches buffered per worker before producers block.
const PREFETCH_PER_WORKER: usize = 2;

enum LoaderKind<T> {
    Inline {
        fetch: Arc<FetchFn<T>>,
        chunks: std::vec::IntoIter<Vec<usize>>,
    },
    Workers {
        rx: Receiver<(usize, anyhow::Result<T>)>,
        pending: HashMap<usize, anyhow::Result<T>>,
    },
}

/// Iterator over batches of `T`, yielding `anyhow::Result<T>` in chunk order.
pub struct BatchLoader<T> {
    kind: LoaderKind<T>,
    next: usize,
    total: usize,
}

impl<T: Send + 'static> BatchLoader<T> {
    /// Start loading `indices` in chunks of `batch_size`.
    ///
    /// The last chunk may be short. Worker threads exit once every chunk has
    /// been fetched or the loader is dropped.
    pub fn new(
        indices: Vec<usize>,
        batch_size: usize,
        num_workers: usize,
        fetch: Arc<FetchFn<T>>,
    ) -> Self {
        let chunks: Vec<Vec<usize>> = indices
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        let total = chunks.len();

        if num_workers == 0 {
            return Self {
                kind: LoaderKind::Inline {
                    fetch,
                    chunks: chunks.into_iter(),
                },
                next: 0,
                total,
            };
        }

        let (job_tx, job_rx) = unbounded::<(usize, Vec<usize>)>();
        for job in chunks.into_iter().enumerate() {
            // The receiver is alive in this scope, so the send cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (res_tx, res_rx) = bounded(num_workers * PREFETCH_PER_WORKER);
        for _ in 0..num_workers.min(total) {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let fetch = fetch.clone();
            thread::spawn(move || {
                for (seq, chunk) in job_rx.iter() {
                    let result = fetch(&chunk);
                    if res_tx.send((seq, result)).is_err() {
                        break;
                    }
                }
            });
        }

        Self {
            kind: LoaderKind::Workers {
                rx: res_rx,
                pending: HashMap::new(),
            },
            next: 0,
            total,
        }
    }
}

impl<T> BatchLoader<T> {
    /// Total number of batches this loader yields.
    pub fn num_batches(&self) -> usize {
        self.total
    }
}

impl<T> Iterator for BatchLoader<T> {
    type Item = anyhow::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let seq = self.next;
        self.next += 1;

        match &mut self.kind {
            LoaderKind::Inline { fetch, chunks } => chunks.next().map(|chunk| fetch(&chunk)),
            LoaderKind::Workers { rx, pending } => {
                if let Some(ready) = pending.remove(&seq) {
                    return Some(ready);
                }
                loop {
                    match rx.recv() {
                        Ok((got, result)) if got == seq => return Some(result),
                        Ok((got, result)) => {
                            pending.insert(got, result);
                        }
                        Err(_) => {
                            self.next = self.total;
                            return Some(Err(anyhow::anyhow!(
                                "loader workers exited before delivering batch {seq}"
                            )));
                        }
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

/// Loader over plain images, each batch tagged with its dataset indices.
pub fn image_loader<D>(
    dataset: Arc<D>,
    indices: Vec<usize>,
    batch_size: usize,
    num_workers: usize,
) -> BatchLoader<IndexedBatch>
where
    D: ImageDataset + ?Sized + 'static,
{
    let fetch = move |chunk: &[usize]| -> anyhow::Result<IndexedBatch> {
        let images = chunk
            .iter()
            .map(|&i| dataset.image(i))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(IndexedBatch {
            images: ImageBatch::stack(images)?,
            indices: chunk.to_vec(),
        })
    };
    BatchLoader::new(indices, batch_size, num_workers, Arc::new(fetch))
}

/// Loader over mined triplets, collated into [`TripletBatch`]es.
pub fn triplet_loader<D>(
    dataset: Arc<D>,
    indices: Vec<usize>,
    batch_size: usize,
    num_workers: usize,
) -> BatchLoader<TripletBatch>
where
    D: TripletDataset + ?Sized + 'static,
{
    let fetch = move |chunk: &[usize]| -> anyhow::Result<TripletBatch> {
        let samples = chunk
            .iter()
            .map(|&i| dataset.sample(i))
            .collect::<anyhow::Result<Vec<_>>>()?;
        collate_triplets(samples)
    };
    BatchLoader::new(indices, batch_size, num_workers, Arc::new(fetch))
}
