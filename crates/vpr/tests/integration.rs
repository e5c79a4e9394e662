//! Integration tests for the vpr crate.
//!
//! A two-parameter linear model stands in for the backbone + NetVLAD network,
//! and the datasets are synthetic 1x1x2 "images". The triplet dataset mines
//! its negatives from the cache file written by the trainer, so these tests
//! exercise cache build -> mining -> loss -> optimizer end to end. All use the
//! NdArray backend.

use std::path::PathBuf;
use std::sync::Arc;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::nn::{Linear, LinearConfig};
use burn::optim::AdamConfig;
use burn::prelude::*;
use feature_store::{read_cache_file, CacheFormat};
use tempfile::TempDir;

use vpr::data::{
    DbStruct, DomainBatches, DomainDataset, Image, ImageDataset, PlaceDataset, TripletDataset,
    TripletSample,
};
use vpr::eval::{evaluate, EvalConfig};
use vpr::model::{grad_reverse, ForwardHead, PlaceModel};
use vpr::training::{
    cache_path, train_epoch, LossDenominator, TrainConfig, TripletMarginLossConfig,
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const IMAGE_SHAPE: [usize; 3] = [1, 1, 2];

#[derive(Module, Debug)]
struct TinyPlaceModel<B: Backend> {
    encoder: Linear<B>,
    domain_head: Linear<B>,
}

impl<B: Backend> TinyPlaceModel<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            encoder: LinearConfig::new(2, 2).init(device),
            domain_head: LinearConfig::new(2, 2).init(device),
        }
    }
}

impl<B: Backend> PlaceModel<B> for TinyPlaceModel<B> {
    fn forward_head(&self, images: Tensor<B, 4>, head: ForwardHead) -> Tensor<B, 2> {
        let [batch, c, h, w] = images.dims();
        let features = self.encoder.forward(images.reshape([batch, c * h * w]));
        match head {
            ForwardHead::Descriptor => features,
            ForwardHead::Domain => self.domain_head.forward(grad_reverse(features, 1.0)),
        }
    }
}

/// Gallery image `g` is `[g, 1]`; query `q` is gallery `q % G` shifted by `query_offset`.
struct PlaceSet {
    db: DbStruct,
    query_offset: f32,
}

impl PlaceSet {
    fn new(num_gallery: usize, num_queries: usize, query_offset: f32) -> Self {
        Self {
            db: DbStruct {
                num_gallery,
                num_queries,
            },
            query_offset,
        }
    }
}

impl ImageDataset for PlaceSet {
    fn len(&self) -> usize {
        self.db.total()
    }

    fn image(&self, index: usize) -> anyhow::Result<Image> {
        if index >= self.len() {
            anyhow::bail!("index {index} out of range");
        }
        let pixels = if index < self.db.num_gallery {
            vec![index as f32, 1.0]
        } else {
            let q = index - self.db.num_gallery;
            vec![(q % self.db.num_gallery) as f32 + self.query_offset, 1.0]
        };
        Image::new(pixels, IMAGE_SHAPE)
    }
}

impl PlaceDataset for PlaceSet {
    fn db_struct(&self) -> DbStruct {
        self.db
    }

    fn positives(&self) -> anyhow::Result<Vec<Vec<usize>>> {
        Ok((0..self.db.num_queries)
            .map(|q| vec![q % self.db.num_gallery])
            .collect())
    }
}

/// Mines the two closest non-positive gallery rows from the on-disk cache.
struct MiningQuerySet {
    whole: Arc<PlaceSet>,
    cache: PathBuf,
    invalid: Vec<usize>,
}

impl TripletDataset for MiningQuerySet {
    fn len(&self) -> usize {
        self.whole.db.num_queries
    }

    fn sample(&self, index: usize) -> anyhow::Result<Option<TripletSample>> {
        if self.invalid.contains(&index) {
            return Ok(None);
        }
        let num_gallery = self.whole.db.num_gallery;
        let cache = read_cache_file(&self.cache)?;
        let query_row = cache.row(num_gallery + index);
        if query_row.iter().all(|&v| v == 0.0) {
            anyhow::bail!("query {index} missing from cache");
        }

        let positive = index % num_gallery;
        let mut candidates: Vec<(f32, usize)> = (0..num_gallery)
            .filter(|&g| g != positive)
            .map(|g| {
                let d = cache
                    .row(g)
                    .iter()
                    .zip(query_row)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>();
                (d, g)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let negatives = candidates
            .iter()
            .take(2)
            .map(|&(_, g)| self.whole.image(g))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Some(TripletSample {
            query: self.whole.image(num_gallery + index)?,
            positive: self.whole.image(positive)?,
            negatives,
            index,
        }))
    }
}

struct DomainSet;

impl DomainDataset for DomainSet {
    fn len(&self) -> usize {
        4
    }

    fn sample(&self, index: usize) -> anyhow::Result<(Image, usize)> {
        let image = Image::new(vec![index as f32, -(index as f32)], IMAGE_SHAPE)?;
        Ok((image, index % 2))
    }
}

fn setup(output: &TempDir, invalid: Vec<usize>) -> (TrainConfig, Arc<PlaceSet>, Arc<MiningQuerySet>) {
    let output_folder = output.path().join("run");
    let config = TrainConfig::new()
        .with_encoder_dim(2)
        .with_num_clusters(1)
        .with_cache_refresh_rate(5)
        .with_batch_size(1)
        .with_cache_batch_size(3)
        .with_num_workers(0)
        .with_lr(1e-2)
        .with_seed(Some(7))
        .with_output_folder(output_folder.to_string_lossy().into_owned());
    let whole = Arc::new(PlaceSet::new(4, 5, 0.25));
    let queries = Arc::new(MiningQuerySet {
        whole: Arc::clone(&whole),
        cache: cache_path(&output_folder, config.cache_format),
        invalid,
    });
    (config, whole, queries)
}

fn weights(model: &TinyPlaceModel<TestAutodiffBackend>) -> Vec<f32> {
    model.encoder.weight.val().into_data().to_vec::<f32>().unwrap()
}

fn head_weights(model: &TinyPlaceModel<TestAutodiffBackend>) -> Vec<f32> {
    model.domain_head.weight.val().into_data().to_vec::<f32>().unwrap()
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[test]
fn test_epoch_counts_skipped_batches() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![3]);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let before = weights(&model);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().with_margin(config.margin).init();

    let (model, report) = train_epoch(
        &config, 1, model, &mut optim, &criterion, whole, queries, None, &device,
    )
    .unwrap();

    assert_eq!(report.epoch, 1);
    assert_eq!(report.iterations, 5);
    assert_eq!(report.valid_batches, 4);
    assert!(report.triplet_loss.is_finite() && report.triplet_loss >= 0.0);
    assert!(report.domain_loss.is_none());
    assert_ne!(weights(&model), before, "optimizer should have updated the encoder");

    let cache = read_cache_file(&config.cache_file()).unwrap();
    assert_eq!(cache.rows(), 9);
    assert_eq!(cache.dim(), 2);
}

#[test]
fn test_epoch_with_background_workers() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![0]);
    let config = config
        .with_num_workers(2)
        .with_loss_denominator(LossDenominator::ValidBatches);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();

    let (_, report) = train_epoch(
        &config, 0, model, &mut optim, &criterion, whole, queries, None, &device,
    )
    .unwrap();

    assert_eq!(report.iterations, 5);
    assert_eq!(report.valid_batches, 4);
}

#[test]
fn test_cache_holds_only_last_subset() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![]);
    // 5 queries at 2 per refresh: subsets of 2, 2 and 1.
    let config = config.with_cache_refresh_rate(2);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();

    let (_, report) = train_epoch(
        &config, 0, model, &mut optim, &criterion, whole, queries, None, &device,
    )
    .unwrap();
    assert_eq!(report.iterations, 5);

    let cache = read_cache_file(&config.cache_file()).unwrap();
    assert_eq!(cache.rows(), 9);
    assert_eq!(cache.nonzero_rows(), 4 + 1);
}

#[cfg(feature = "hdf5")]
#[test]
fn test_epoch_writes_hdf5_cache() {
    let dir = TempDir::new().unwrap();
    let (config, whole, _) = setup(&dir, vec![]);
    let config = config.with_cache_format(CacheFormat::Hdf5);
    let queries = Arc::new(MiningQuerySet {
        whole: Arc::clone(&whole),
        cache: config.cache_file(),
        invalid: vec![],
    });
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();

    let (_, report) = train_epoch(
        &config, 0, model, &mut optim, &criterion, whole, queries, None, &device,
    )
    .unwrap();
    assert_eq!(report.valid_batches, 5);

    assert!(config.cache_file().ends_with("cache.hdf5"));
    let cache = read_cache_file(&config.cache_file()).unwrap();
    assert_eq!((cache.rows(), cache.dim()), (9, 2));
}

#[cfg(not(feature = "hdf5"))]
#[test]
fn test_hdf5_cache_needs_feature() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![]);
    let config = config.with_cache_format(CacheFormat::Hdf5);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();

    let result = train_epoch(
        &config, 0, model, &mut optim, &criterion, whole, queries, None, &device,
    );
    assert!(result.is_err());
    assert!(!config.cache_file().exists());
}

#[test]
fn test_epoch_with_domain_adversarial_loss() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![]);
    let config = config.with_grl(true).with_grl_batch_size(4);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();
    let mut domain = DomainBatches::from_config(Arc::new(DomainSet), &config).unwrap();

    let (_, report) = train_epoch(
        &config,
        0,
        model,
        &mut optim,
        &criterion,
        whole,
        queries,
        Some(&mut domain),
        &device,
    )
    .unwrap();

    let grl_loss = report.domain_loss.expect("domain loss should be reported");
    assert!(grl_loss.is_finite() && grl_loss > 0.0);
    // One full 4-sample pass per valid batch.
    assert_eq!(domain.passes(), 5);
}

#[test]
fn test_domain_loss_weight_reaches_gradient() {
    let device = Default::default();
    let initial = TinyPlaceModel::<TestAutodiffBackend>::new(&device);

    let run = |weight: f64| {
        let dir = TempDir::new().unwrap();
        let (config, whole, queries) = setup(&dir, vec![]);
        let config = config
            .with_grl(true)
            .with_grl_batch_size(2)
            .with_grl_loss_weight(weight);
        let mut optim = AdamConfig::new().init();
        let criterion = TripletMarginLossConfig::new().init();
        let mut domain = DomainBatches::from_config(Arc::new(DomainSet), &config).unwrap();
        let (model, _) = train_epoch(
            &config,
            0,
            initial.clone(),
            &mut optim,
            &criterion,
            whole,
            queries,
            Some(&mut domain),
            &device,
        )
        .unwrap();
        model
    };

    let unweighted = run(0.0);
    let weighted = run(1.0);

    // Zero weight leaves the domain head untouched; a positive weight trains
    // it and pushes the reversed gradient into the encoder.
    assert_eq!(head_weights(&unweighted), head_weights(&initial));
    assert_ne!(head_weights(&weighted), head_weights(&initial));
    assert_ne!(weights(&weighted), weights(&unweighted));
}

#[test]
fn test_domain_batch_size_mismatch_is_error() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![]);
    let config = config.with_grl(true).with_grl_batch_size(4);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();
    let mut domain = DomainBatches::new(Arc::new(DomainSet), 3, 0, Some(1)).unwrap();

    let result = train_epoch(
        &config,
        0,
        model,
        &mut optim,
        &criterion,
        whole,
        queries,
        Some(&mut domain),
        &device,
    );
    assert!(result.is_err());
    assert_eq!(domain.passes(), 0);
}

#[test]
fn test_grl_without_domain_loader_is_error() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![]);
    let config = config.with_grl(true);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();

    let result = train_epoch(
        &config, 0, model, &mut optim, &criterion, whole, queries, None, &device,
    );
    assert!(result.is_err());
}

#[test]
fn test_all_invalid_queries_still_complete() {
    let dir = TempDir::new().unwrap();
    let (config, whole, queries) = setup(&dir, vec![0, 1, 2, 3, 4]);
    let device = Default::default();
    let model = TinyPlaceModel::<TestAutodiffBackend>::new(&device);
    let before = weights(&model);
    let mut optim = AdamConfig::new().init();
    let criterion = TripletMarginLossConfig::new().init();

    let (model, report) = train_epoch(
        &config, 0, model, &mut optim, &criterion, whole, queries, None, &device,
    )
    .unwrap();
    assert_eq!(report.iterations, 5);
    assert_eq!(report.valid_batches, 0);
    assert_eq!(report.triplet_loss, 0.0);
    assert_eq!(weights(&model), before);
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[test]
fn test_evaluate_injected_nearest_neighbour() {
    // Queries are exact copies of their positive gallery image, so any
    // deterministic model ranks the positive first.
    let eval_set = Arc::new(PlaceSet::new(6, 9, 0.0));
    let device = Default::default();
    let model = TinyPlaceModel::<TestBackend>::new(&device);

    for on_device in [false, true] {
        let config = EvalConfig::new()
            .with_encoder_dim(2)
            .with_num_clusters(1)
            .with_cache_batch_size(4)
            .with_num_workers(2)
            .with_index_on_device(on_device);
        let report = evaluate(&config, Arc::clone(&eval_set), &model, &device).unwrap();

        for n in [1, 5, 10, 20] {
            assert_eq!(report.recall_at(n), Some(1.0), "recall@{n}, on_device={on_device}");
        }
        assert_eq!(report.formatted, "100,0 \t100,0 \t100,0 \t100,0 \t");
    }
}

#[test]
fn test_evaluate_metadata_mismatch() {
    struct Lying(PlaceSet);

    impl ImageDataset for Lying {
        fn len(&self) -> usize {
            self.0.len() - 1
        }

        fn image(&self, index: usize) -> anyhow::Result<Image> {
            self.0.image(index)
        }
    }

    impl PlaceDataset for Lying {
        fn db_struct(&self) -> DbStruct {
            self.0.db_struct()
        }

        fn positives(&self) -> anyhow::Result<Vec<Vec<usize>>> {
            self.0.positives()
        }
    }

    let device = Default::default();
    let model = TinyPlaceModel::<TestBackend>::new(&device);
    let config = EvalConfig::new().with_encoder_dim(2).with_num_clusters(1);
    let result = evaluate(&config, Arc::new(Lying(PlaceSet::new(3, 2, 0.0))), &model, &device);
    assert!(result.is_err());
}
