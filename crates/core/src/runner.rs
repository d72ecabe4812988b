// src/runner.rs
//
// Run dispatcher: build loaders from a `RunConfig` and drive a `Trainer`
// through the configured ops.

use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Op, RunConfig, RunOverrides};
use crate::dataset::Batch;
use crate::h5_loader::H5DataLoader;
use crate::metrics::Metrics;
use crate::sampler::{Sampler, SamplerMode};
use crate::sampler_loader::SamplerDataLoader;

/// The model side of a run. The loader side hands it one batch at a time.
pub trait Trainer {
    /// Called once before any op, after overrides are applied.
    fn init(&mut self, _rank: usize, _world_size: usize, _gpu: Option<usize>) -> Result<()> {
        Ok(())
    }

    /// One optimisation step; returns the training loss.
    fn train_batch(&mut self, batch: &Batch, lr: f64) -> Result<f32>;

    /// Loss on a held-out batch, without updating anything.
    fn evaluate_batch(&mut self, batch: &Batch) -> Result<f32>;
}

/// Trainer with no model: checks that batch shapes stay fixed and reports
/// the mean target value as its loss.
#[derive(Debug, Default)]
pub struct LoaderBench {
    sequence_shape: Option<Vec<usize>>,
    targets_shape: Option<Vec<usize>>,
    steps: u64,
}

impl LoaderBench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn check(&mut self, batch: &Batch) -> Result<f32> {
        let seq = batch.sequences.shape()[1..].to_vec();
        let tgt = batch.targets.shape()[1..].to_vec();
        match (&self.sequence_shape, &self.targets_shape) {
            (Some(s), Some(t)) => {
                if s != &seq || t != &tgt {
                    anyhow::bail!(
                        "batch shape changed: sequences {:?} -> {:?}, targets {:?} -> {:?}",
                        s,
                        seq,
                        t,
                        tgt
                    );
                }
            }
            _ => {
                debug!("bench sees sequences {:?}, targets {:?}", seq, tgt);
                self.sequence_shape = Some(seq);
                self.targets_shape = Some(tgt);
            }
        }
        self.steps += 1;
        Ok(batch.targets.mean().unwrap_or(0.0))
    }
}

impl Trainer for LoaderBench {
    fn train_batch(&mut self, batch: &Batch, _lr: f64) -> Result<f32> {
        self.check(batch)
    }

    fn evaluate_batch(&mut self, batch: &Batch) -> Result<f32> {
        self.check(batch)
    }
}

/// Metrics for one executed op.
#[derive(Debug, Clone)]
pub struct OpReport {
    pub op: Op,
    pub metrics: Metrics,
    /// (step, mean validation loss) for every periodic validation during training
    pub validations: Vec<(usize, f32)>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub ops: Vec<OpReport>,
}

impl RunReport {
    pub fn get(&self, op: Op) -> Option<&OpReport> {
        self.ops.iter().find(|r| r.op == op)
    }
}

/// A loader for one partition, whichever backend it reads from.
enum Source {
    H5(H5DataLoader),
    Sampled(SamplerDataLoader<Box<dyn Sampler>>),
}

impl Source {
    /// Start a new pass over this source.
    fn batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>> {
        match self {
            Source::H5(loader) => Ok(Box::new(loader.iter()?)),
            Source::Sampled(loader) => Ok(Box::new(loader.iter()?)),
        }
    }

    /// Make the next pass replay the first one.
    fn rewind(&mut self) {
        match self {
            Source::H5(loader) => loader.set_epoch(0),
            Source::Sampled(loader) => loader.set_epoch(0),
        }
    }

    fn is_bounded(&self) -> bool {
        matches!(self, Source::H5(_))
    }
}

fn build_source(config: &RunConfig, mode: SamplerMode) -> Result<Option<Source>> {
    if config.data.is_some() {
        let Some(source) = config.h5_source(mode) else {
            return Ok(None);
        };
        let mut options = config.h5_loader_options(source);
        if mode != SamplerMode::Train && source.shuffle.is_none() {
            options.shuffle = false;
        }
        let loader = H5DataLoader::new(&source.path, options)
            .with_context(|| format!("Failed to build {} loader", mode))?
            .with_shard(config.shard()?);
        info!("{} source: {:?} ({} batches per epoch)", mode, source.path, loader.len());
        return Ok(Some(Source::H5(loader)));
    }

    let Some(sampler_config) = &config.sampler else {
        return Ok(None);
    };
    let sampler = sampler_config.build(mode, config.random_seed)?;
    let loader = SamplerDataLoader::new(sampler, config.sampler_loader_options())
        .with_context(|| format!("Failed to build {} sampler loader", mode))?;
    info!("{} source: synthetic sampler, batch size {}", mode, loader.batch_size());
    Ok(Some(Source::Sampled(loader)))
}

/// Apply `overrides`, build loaders and execute `config.ops` in order.
pub fn parse_configs_and_run(
    mut config: RunConfig,
    overrides: &RunOverrides,
    trainer: &mut dyn Trainer,
) -> Result<RunReport> {
    config.apply_overrides(overrides)?;
    let shard = config.shard()?;
    info!(
        "Starting run: ops={:?}, rank {}/{}, gpu={:?}",
        config.ops, shard.rank, shard.world_size, config.distributed.gpu
    );
    trainer.init(shard.rank, shard.world_size, config.distributed.gpu)?;

    let mut validation = if config.ops.iter().any(|op| matches!(op, Op::Train | Op::Validate)) {
        build_source(&config, SamplerMode::Validate)?
    } else {
        None
    };

    let mut report = RunReport::default();
    for op in config.ops.clone() {
        let op_report = match op {
            Op::Train => {
                let mut train = build_source(&config, SamplerMode::Train)?
                    .context("ops include train but no training source is configured")?;
                train_op(&config, &mut train, validation.as_mut(), trainer)?
            }
            Op::Validate => {
                let source = validation
                    .as_mut()
                    .context("ops include validate but no validation source is configured")?;
                let metrics = evaluate(source, trainer, config.train_model.n_validation_samples)
                    .context("Validation failed")?;
                OpReport {
                    op,
                    metrics,
                    validations: Vec::new(),
                }
            }
            Op::Evaluate => {
                let mut test = build_source(&config, SamplerMode::Test)?
                    .context("ops include evaluate but no test source is configured")?;
                let limit = config
                    .train_model
                    .n_test_samples
                    .or(config.train_model.n_validation_samples);
                let metrics = evaluate(&mut test, trainer, limit).context("Evaluation failed")?;
                OpReport {
                    op,
                    metrics,
                    validations: Vec::new(),
                }
            }
        };
        op_report.metrics.log_summary(&format!("{:?}", op));
        report.ops.push(op_report);
    }
    Ok(report)
}

fn train_op(
    config: &RunConfig,
    train: &mut Source,
    mut validation: Option<&mut Source>,
    trainer: &mut dyn Trainer,
) -> Result<OpReport> {
    let lr = config
        .lr
        .context("lr must be set in the config or with --lr when ops include train")?;
    let max_steps = config.train_model.max_steps;
    let every = config.train_model.report_stats_every_n_steps;

    let mut metrics = Metrics::new();
    let mut validations = Vec::new();
    let mut step = 0usize;
    let mut last_report = 0usize;
    let start = Instant::now();

    'epochs: while step < max_steps {
        let mut batches = train.batches()?;
        let mut produced = 0usize;
        loop {
            if step >= max_steps {
                break 'epochs;
            }
            let wait = Instant::now();
            let Some(batch) = batches.next() else { break };
            let batch = batch.with_context(|| format!("Failed to load training batch at step {}", step))?;
            metrics.record_batch(wait.elapsed(), batch.len(), batch.nbytes());
            produced += 1;

            let loss = trainer
                .train_batch(&batch, lr)
                .with_context(|| format!("Training failed at step {}", step))?;
            metrics.record_loss(loss);
            step += 1;

            if step % every == 0 {
                info!(
                    "step {}/{}: train loss {:.6}",
                    step,
                    max_steps,
                    metrics.mean_loss_since(last_report).unwrap_or(f32::NAN)
                );
                last_report = metrics.losses.len();
                if let Some(source) = validation.as_deref_mut() {
                    let limit = config.train_model.n_validation_samples;
                    if limit.is_none() && !source.is_bounded() {
                        warn!("skipping periodic validation: n_validation_samples is not set");
                    } else {
                        let val = evaluate(source, trainer, limit)
                            .with_context(|| format!("Validation failed at step {}", step))?;
                        let loss = val.mean_loss().unwrap_or(f32::NAN);
                        info!("step {}: validation loss {:.6}", step, loss);
                        validations.push((step, loss));
                    }
                }
            }
        }
        if produced == 0 {
            anyhow::bail!("training source produced no batches; check the data file and drop_last");
        }
    }

    metrics.record_total_time(start.elapsed());
    Ok(OpReport {
        op: Op::Train,
        metrics,
        validations,
    })
}

/// Evaluate exactly `limit` samples (fewer if the source runs out), or one
/// full pass when `limit` is unset. Every call sees the same samples.
fn evaluate(source: &mut Source, trainer: &mut dyn Trainer, limit: Option<usize>) -> Result<Metrics> {
    if limit.is_none() && !source.is_bounded() {
        anyhow::bail!("n_validation_samples must be set when evaluating a sampler source");
    }
    let limit = limit.unwrap_or(usize::MAX);

    let mut metrics = Metrics::new();
    let start = Instant::now();
    let mut seen = 0usize;
    source.rewind();
    let mut batches = source.batches()?;
    while seen < limit {
        let wait = Instant::now();
        let Some(batch) = batches.next() else { break };
        let batch = batch.context("Failed to load evaluation batch")?;
        let batch = if batch.len() > limit - seen {
            batch.head(limit - seen)
        } else {
            batch
        };
        metrics.record_batch(wait.elapsed(), batch.len(), batch.nbytes());
        seen += batch.len();
        metrics.record_loss(trainer.evaluate_batch(&batch)?);
    }
    metrics.record_total_time(start.elapsed());
    debug!("evaluated {} samples in {} batches", seen, metrics.batches);
    Ok(metrics)
}
