// src/loader/mod.rs
//
// Batching data loader with an optional worker pool.
//
pub mod index;
mod workers;

pub use index::{batch_count, BatchIndices, IndexOrder, ShardSpec};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::dataset::{Batch, Dataset, WorkerInfo};
use workers::WorkerPool;

/// Knobs shared by every loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// 0 loads on the calling thread
    pub num_workers: usize,
    /// Batches queued per worker
    pub prefetch_factor: usize,
    pub seed: u64,
    pub drop_last: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_workers: 1,
            prefetch_factor: 2,
            seed: 436,
            drop_last: false,
        }
    }
}

impl LoaderOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if self.prefetch_factor == 0 {
            anyhow::bail!("prefetch_factor must be > 0");
        }
        let max_workers = num_cpus::get().max(1) * 8;
        if self.num_workers > max_workers {
            anyhow::bail!(
                "num_workers {} exceeds the limit of {} for this machine",
                self.num_workers,
                max_workers
            );
        }
        Ok(())
    }
}

/// Turns a `Dataset` plus an index order into a stream of batches.
pub struct DataLoader<D> {
    dataset: D,
    order: IndexOrder,
    options: LoaderOptions,
    shard: ShardSpec,
    epoch: u64,
}

impl<D> DataLoader<D>
where
    D: Dataset + Clone + 'static,
{
    pub fn new(dataset: D, order: IndexOrder, options: LoaderOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            dataset,
            order,
            options,
            shard: ShardSpec::default(),
            epoch: 0,
        })
    }

    /// Restrict every epoch to one rank's share of the indices.
    pub fn with_shard(mut self, shard: ShardSpec) -> Self {
        self.shard = shard;
        self
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn order(&self) -> &IndexOrder {
        &self.order
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Number of `iter()` calls made so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Make the next `iter()` run as epoch `epoch`. Replaying an epoch gives
    /// the same order and the same worker seeds.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Batches per epoch for this rank.
    pub fn len(&self) -> usize {
        batch_count(
            self.shard.shard_len(self.order.len()),
            self.options.batch_size,
            self.options.drop_last,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new epoch. Batches are yielded in index order regardless of
    /// which worker produced them.
    pub fn iter(&mut self) -> Result<LoaderIter<'_, D>> {
        let epoch = self.epoch;
        self.epoch += 1;

        let indices = self.order.epoch_indices(self.options.seed, epoch, self.shard);
        let batches = BatchIndices::new(indices, self.options.batch_size, self.options.drop_last);

        let mode = if self.options.num_workers == 0 {
            self.dataset.worker_init(WorkerInfo {
                id: 0,
                num_workers: 0,
                epoch,
            })?;
            Mode::Inline(&mut self.dataset)
        } else {
            let pool = WorkerPool::spawn(
                &self.dataset,
                self.options.num_workers,
                self.options.prefetch_factor,
                epoch,
            )?;
            Mode::Pool(PoolState {
                window: pool.num_workers() * self.options.prefetch_factor,
                pool,
                next_to_submit: 0,
                next_to_yield: 0,
                in_flight: 0,
                ready: BTreeMap::new(),
            })
        };
        debug!("loader epoch {} started ({} workers)", epoch, self.options.num_workers);

        Ok(LoaderIter {
            batches,
            exhausted: false,
            mode,
        })
    }
}

/// One epoch of batches.
pub struct LoaderIter<'a, D> {
    batches: BatchIndices<Box<dyn Iterator<Item = usize> + Send>>,
    exhausted: bool,
    mode: Mode<'a, D>,
}

enum Mode<'a, D> {
    Inline(&'a mut D),
    Pool(PoolState),
}

struct PoolState {
    pool: WorkerPool,
    window: usize,
    next_to_submit: usize,
    next_to_yield: usize,
    in_flight: usize,
    ready: BTreeMap<usize, Result<Batch>>,
}

impl<'a, D: Dataset> Iterator for LoaderIter<'a, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        match &mut self.mode {
            Mode::Inline(dataset) => {
                if self.exhausted {
                    return None;
                }
                match self.batches.next() {
                    Some(indices) => Some(dataset.get_batch(&indices)),
                    None => {
                        self.exhausted = true;
                        None
                    }
                }
            }
            Mode::Pool(state) => {
                loop {
                    // Keep at most `window` batches between the consumer and the workers.
                    while !self.exhausted && state.next_to_submit - state.next_to_yield < state.window {
                        match self.batches.next() {
                            Some(indices) => {
                                let position = state.next_to_submit;
                                state.next_to_submit += 1;
                                match state.pool.submit(position, indices) {
                                    Ok(()) => state.in_flight += 1,
                                    Err(e) => {
                                        state.ready.insert(position, Err(e));
                                    }
                                }
                            }
                            None => self.exhausted = true,
                        }
                    }

                    if let Some(result) = state.ready.remove(&state.next_to_yield) {
                        state.next_to_yield += 1;
                        return Some(result);
                    }
                    if state.in_flight == 0 {
                        return None;
                    }

                    match state.pool.recv() {
                        Ok((position, result)) => {
                            state.in_flight -= 1;
                            state.ready.insert(position, result);
                        }
                        Err(e) => {
                            self.exhausted = true;
                            state.in_flight = 0;
                            state.ready.clear();
                            state.next_to_yield = state.next_to_submit;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}
