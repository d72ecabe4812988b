// src/sampler_loader.rs
//
// Parallel on-the-fly sampling through the regular loader machinery.

use anyhow::{Context, Result};
use ndarray::Axis;

use crate::dataset::{Batch, Dataset, Sample, WorkerInfo};
use crate::loader::{DataLoader, IndexOrder, LoaderIter, LoaderOptions};
use crate::sampler::Sampler;

/// Dataset view over a `Sampler`.
///
/// Index values are ignored: only the number of requested indices decides
/// how much is sampled. The length is `usize::MAX` so iteration is bounded
/// by the caller, not by the dataset.
#[derive(Clone)]
pub struct SamplerDataset<S> {
    sampler: S,
    seed: u64,
}

impl<S: Sampler + Clone> SamplerDataset<S> {
    pub fn new(sampler: S, seed: u64) -> Self {
        Self { sampler, seed }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }
}

impl<S: Sampler + Clone> Dataset for SamplerDataset<S> {
    fn len(&self) -> usize {
        usize::MAX
    }

    fn get(&mut self, _index: usize) -> Result<Sample> {
        let batch = self.sampler.sample(1)?;
        batch
            .sample(0)
            .context("sampler returned an empty batch for a single draw")
    }

    fn get_batch(&mut self, indices: &[usize]) -> Result<Batch> {
        let batch = self.sampler.sample(indices.len())?;
        if batch.sequences.len_of(Axis(0)) != indices.len() || batch.targets.len_of(Axis(0)) != indices.len() {
            anyhow::bail!(
                "sampler returned {} sequences and {} targets for a batch of {}",
                batch.sequences.len_of(Axis(0)),
                batch.targets.len_of(Axis(0)),
                indices.len()
            );
        }
        Ok(batch)
    }

    /// Worker `id` draws from `seed + id`; later epochs move past every
    /// seed used by earlier ones.
    fn worker_init(&mut self, info: WorkerInfo) -> Result<()> {
        let stride = info.num_workers.max(1) as u64;
        let seed = self
            .seed
            .wrapping_add(info.id as u64)
            .wrapping_add(info.epoch.wrapping_mul(stride));
        self.sampler.reseed(seed);
        Ok(())
    }
}

/// Options for `SamplerDataLoader`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerLoaderOptions {
    pub num_workers: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub prefetch_factor: usize,
}

impl Default for SamplerLoaderOptions {
    fn default() -> Self {
        Self {
            num_workers: 1,
            batch_size: 1,
            seed: 436,
            prefetch_factor: 2,
        }
    }
}

/// Parallel sampling for any `Sampler`.
pub struct SamplerDataLoader<S> {
    inner: DataLoader<SamplerDataset<S>>,
}

impl<S> SamplerDataLoader<S>
where
    S: Sampler + Clone + 'static,
{
    pub fn new(sampler: S, options: SamplerLoaderOptions) -> Result<Self> {
        let dataset = SamplerDataset::new(sampler, options.seed);
        let loader_options = LoaderOptions {
            batch_size: options.batch_size,
            num_workers: options.num_workers,
            prefetch_factor: options.prefetch_factor,
            seed: options.seed,
            drop_last: false,
        };
        let inner = DataLoader::new(dataset, IndexOrder::Sequential { len: usize::MAX }, loader_options)?;
        Ok(Self { inner })
    }

    pub fn batch_size(&self) -> usize {
        self.inner.options().batch_size
    }

    pub fn num_workers(&self) -> usize {
        self.inner.options().num_workers
    }

    pub fn dataset(&self) -> &SamplerDataset<S> {
        self.inner.dataset()
    }

    /// Make the next pass reuse the worker seeds of pass `epoch`.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.inner.set_epoch(epoch);
    }

    /// A fresh, effectively unbounded pass; bound it with `take`.
    pub fn iter(&mut self) -> Result<LoaderIter<'_, SamplerDataset<S>>> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{SamplerMode, SyntheticSampler, SyntheticSamplerConfig};

    fn sampler() -> SyntheticSampler {
        SyntheticSampler::new(
            SyntheticSamplerConfig {
                sequence_length: 16,
                n_targets: 5,
                ambiguous_rate: 0.0,
                positive_rate: 0.5,
            },
            SamplerMode::Train,
            1,
        )
        .unwrap()
    }

    #[test]
    fn dataset_is_unbounded_and_drops_batch_dim() {
        let mut dataset = SamplerDataset::new(sampler(), 436);
        assert_eq!(dataset.len(), usize::MAX);
        let item = dataset.get(12345).unwrap();
        assert_eq!(item.sequence.shape(), &[16, 4]);
        assert_eq!(item.targets.shape(), &[5]);

        let batch = dataset.get_batch(&[7, 7, 7]).unwrap();
        assert_eq!(batch.sequences.shape(), &[3, 16, 4]);
    }

    #[test]
    fn worker_seeds_follow_seed_plus_worker_id() {
        let mut w0 = SamplerDataset::new(sampler(), 436);
        let mut w1 = w0.clone();
        w0.worker_init(WorkerInfo { id: 0, num_workers: 2, epoch: 0 }).unwrap();
        w1.worker_init(WorkerInfo { id: 1, num_workers: 2, epoch: 0 }).unwrap();

        let mut expected0 = sampler();
        expected0.reseed(436);
        let mut expected1 = sampler();
        expected1.reseed(437);
        assert_eq!(w0.get_batch(&[0, 1]).unwrap(), expected0.sample(2).unwrap());
        assert_eq!(w1.get_batch(&[0, 1]).unwrap(), expected1.sample(2).unwrap());
    }

    #[test]
    fn loader_streams_batches_of_requested_size() {
        let options = SamplerLoaderOptions {
            num_workers: 2,
            batch_size: 8,
            ..Default::default()
        };
        let mut loader = SamplerDataLoader::new(sampler(), options).unwrap();
        assert_eq!(loader.batch_size(), 8);
        assert_eq!(loader.num_workers(), 2);

        let batches: Vec<Batch> = loader.iter().unwrap().take(4).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.sequences.shape() == &[8, 16, 4]));
        // two workers with different seeds draw different data
        assert_ne!(batches[0], batches[1]);

        // a second pass starts over without exhausting anything
        assert_eq!(loader.iter().unwrap().take(2).count(), 2);
    }

    #[test]
    fn set_epoch_repeats_the_same_draws() {
        let options = SamplerLoaderOptions {
            num_workers: 2,
            batch_size: 4,
            ..Default::default()
        };
        let mut loader = SamplerDataLoader::new(sampler(), options).unwrap();
        let first: Vec<Batch> = loader.iter().unwrap().take(3).map(|b| b.unwrap()).collect();
        let next: Vec<Batch> = loader.iter().unwrap().take(3).map(|b| b.unwrap()).collect();
        assert_ne!(first, next);
        loader.set_epoch(0);
        let replay: Vec<Batch> = loader.iter().unwrap().take(3).map(|b| b.unwrap()).collect();
        assert_eq!(first, replay);
    }

    #[test]
    fn loader_runs_reproducibly_for_a_fixed_seed() {
        let options = SamplerLoaderOptions {
            num_workers: 3,
            batch_size: 2,
            seed: 99,
            ..Default::default()
        };
        let mut a = SamplerDataLoader::new(sampler(), options.clone()).unwrap();
        let mut b = SamplerDataLoader::new(sampler(), options).unwrap();
        let from_a: Vec<Batch> = a.iter().unwrap().take(6).map(|r| r.unwrap()).collect();
        let from_b: Vec<Batch> = b.iter().unwrap().take(6).map(|r| r.unwrap()).collect();
        assert_eq!(from_a, from_b);
    }
}
