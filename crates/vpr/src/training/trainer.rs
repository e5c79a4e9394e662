//! One epoch of triplet training with periodic feature-cache refresh.
//!
//! The query set is shuffled and split into subsets. For each subset the
//! cache is rebuilt with the current weights, then the subset's triplets are
//! trained on in loader order. When adversarial training is on, every valid
//! triplet batch is paired with one domain batch and both losses feed a single
//! optimizer step.

use std::sync::Arc;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::{
    triplet_loader, DomainBatch, DomainBatches, ImageBatch, PlaceDataset, TripletBatch,
    TripletDataset, Triplets,
};
use crate::extract::progress_bar;
use crate::model::bridge::{images_to_tensor, labels_to_tensor, tensor_to_f64};
use crate::model::PlaceModel;
use crate::training::cache::build_cache;
use crate::training::config::TrainConfig;
use crate::training::loss::{domain_loss, triplet_loss, TripletCriterion};
use crate::training::metrics::{format_elapsed, BatchOutcome, EpochReport, LossAccumulator};
use crate::training::partition::SubsetPartition;

/// Run one training epoch.
///
/// # Arguments
/// - `model`: consumed and returned with updated weights
/// - `whole_train_set`: gallery + queries, encoded into the cache
/// - `query_train_set`: mines triplets from the cache written by this function
/// - `domain`: required when `config.grl` is set, ignored otherwise; its
///   batch size must equal `config.grl_batch_size`
///
/// The subset permutation is drawn from [`partition_rng`].
/// # Errors
/// Any loader, forward, cache I/O or shape failure aborts the epoch.
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<B, M, O, C, W, Q>(
    config: &TrainConfig,
    epoch: usize,
    mut model: M,
    optimizer: &mut O,
    criterion: &C,
    whole_train_set: Arc<W>,
    query_train_set: Arc<Q>,
    mut domain: Option<&mut DomainBatches>,
    device: &B::Device,
) -> anyhow::Result<(M, EpochReport)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + PlaceModel<B>,
    M::InnerModule: PlaceModel<B::InnerBackend>,
    O: Optimizer<M, B>,
    C: TripletCriterion<B>,
    W: PlaceDataset + ?Sized + 'static,
    Q: TripletDataset + ?Sized + 'static,
{
    config.validate()?;
    if config.grl {
        match domain.as_deref() {
            None => anyhow::bail!(
                "adversarial training is enabled but no domain loader was supplied"
            ),
            Some(batches) if batches.batch_size() != config.grl_batch_size => anyhow::bail!(
                "domain loader batch size {} does not match grl_batch_size {}",
                batches.batch_size(),
                config.grl_batch_size
            ),
            Some(_) => {}
        }
    }

    let epoch_start = Instant::now();
    let num_queries = query_train_set.len();
    let partition = SubsetPartition::random(
        num_queries,
        config.cache_refresh_rate,
        config.epoch_divider,
        &mut partition_rng(config, epoch),
    )?;
    let expected_batches = config.cache_refresh_rate * partition.len() / config.batch_size;
    let output_folder = config.output_dir();
    let settings = config.cache_extraction();
    let mut acc = LossAccumulator::default();

    tracing::info!(
        epoch,
        queries = num_queries,
        subsets = partition.len(),
        grl = config.grl,
        "Starting epoch"
    );

    for sub_iter in 0..partition.len() {
        let useful = partition.useful(sub_iter, config.cache_refresh_rate);

        tracing::debug!(
            epoch,
            subset = sub_iter + 1,
            subsets = partition.len(),
            "Building cache"
        );
        build_cache::<B::InnerBackend, _, _>(
            &model.valid(),
            Arc::clone(&whole_train_set),
            useful,
            &settings,
            &output_folder,
            config.cache_format,
            device,
        )?;

        let loader = triplet_loader(
            Arc::clone(&query_train_set),
            useful.to_vec(),
            config.batch_size,
            config.num_workers,
        );
        let pb = progress_bar(
            loader.num_batches(),
            &format!("epoch {epoch:02} subset {}/{}", sub_iter + 1, partition.len()),
        );
        let before = acc.iterations;

        for batch in loader {
            let outcome = match batch? {
                TripletBatch::Empty => BatchOutcome::Skipped,
                TripletBatch::Valid(triplets) => {
                    let domain_batch = match domain.as_deref_mut() {
                        Some(batches) if config.grl => Some(batches.next_batch()?),
                        _ => None,
                    };
                    let (updated, outcome) = train_step(
                        config,
                        model,
                        optimizer,
                        criterion,
                        &triplets,
                        domain_batch.as_ref(),
                        device,
                    )?;
                    model = updated;
                    outcome
                }
            };
            acc = acc.record(outcome);
            pb.inc(1);
        }
        pb.finish_and_clear();

        if acc.iterations == before {
            tracing::warn!(epoch, subset = sub_iter + 1, "Subset produced no batches");
        }
        if acc.iterations == 0 {
            anyhow::bail!("no training batches after subset {} of epoch {epoch}", sub_iter + 1);
        }

        let (avg_loss, avg_grl_loss) = acc.running_averages(config.loss_denominator);
        tracing::debug!(
            epoch,
            iterations = acc.iterations,
            expected = expected_batches,
            batch_loss = acc.last_batch_loss.map(|l| format!("{l:.4}")).unwrap_or_default(),
            avg_loss = avg_loss.map(|l| format!("{l:.4}")).unwrap_or_default(),
            "Epoch[{epoch:02}]({}/{expected_batches})",
            acc.iterations
        );
        if config.grl {
            tracing::debug!(
                avg_grl_loss = avg_grl_loss.map(|l| format!("{l:.4}")).unwrap_or_default(),
                "Domain loss"
            );
        }
    }

    let elapsed = epoch_start.elapsed();
    let report = EpochReport {
        epoch,
        triplet_loss: acc.average_triplet(config.loss_denominator)?,
        domain_loss: if config.grl {
            acc.average_domain(config.loss_denominator)
        } else {
            None
        },
        iterations: acc.iterations,
        valid_batches: acc.valid_batches,
        elapsed,
    };

    tracing::info!(
        epoch,
        elapsed = %format_elapsed(elapsed),
        iterations = report.iterations,
        valid_batches = report.valid_batches,
        "Finished epoch {epoch:02}: average triplet loss = {:.4}",
        report.triplet_loss
    );
    if let Some(grl_loss) = report.domain_loss {
        tracing::info!(epoch, "Average epoch grl loss = {grl_loss:.4}");
    }

    Ok((model, report))
}

/// RNG for an epoch's subset permutation.
///
/// Seeded runs offset `config.seed` by the epoch so each epoch reshuffles
/// while staying reproducible.
pub fn partition_rng(config: &TrainConfig, epoch: usize) -> StdRng {
    match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
        None => StdRng::from_entropy(),
    }
}

/// Forward, loss, backward and one optimizer step for a valid batch.
///
/// The recorded domain loss is the unweighted cross-entropy; the weight only
/// scales its gradient contribution.
fn train_step<B, M, O, C>(
    config: &TrainConfig,
    model: M,
    optimizer: &mut O,
    criterion: &C,
    triplets: &Triplets,
    domain: Option<&DomainBatch>,
    device: &B::Device,
) -> anyhow::Result<(M, BatchOutcome)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + PlaceModel<B>,
    O: Optimizer<M, B>,
    C: TripletCriterion<B>,
{
    let offsets = triplets.offsets();
    let images = ImageBatch::concat(&[&triplets.query, &triplets.positives, &triplets.negatives])?;
    let encoding = model.descriptors(images_to_tensor::<B>(&images, device));
    let loss = triplet_loss(criterion, encoding, triplets.batch_size(), &offsets)?;
    let triplet_val = tensor_to_f64(loss.clone());

    let (total, domain_val) = match domain {
        Some(batch) => {
            let logits = model.domain_logits(images_to_tensor::<B>(&batch.images, device));
            let grl_loss = domain_loss(logits, labels_to_tensor::<B>(&batch.labels, device));
            let val = tensor_to_f64(grl_loss.clone());
            (loss + grl_loss.mul_scalar(config.grl_loss_weight), Some(val))
        }
        None => (loss, None),
    };

    let grads = GradientsParams::from_grads(total.backward(), &model);
    let model = optimizer.step(config.lr, model, grads);

    Ok((
        model,
        BatchOutcome::Trained {
            triplet: triplet_val,
            domain: domain_val,
        },
    ))
}
