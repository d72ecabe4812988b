// src/sampler.rs
//
// Sampler seam: anything that can draw (sequence, target) batches on the fly.
// Genome/interval samplers live outside this crate; `SyntheticSampler` is a
// self-contained generator for smoke runs, benchmarks and tests.

use anyhow::Result;
use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::dataset::Batch;

/// Which partition of the data a sampler draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerMode {
    Train,
    Validate,
    Test,
}

impl SamplerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerMode::Train => "train",
            SamplerMode::Validate => "validate",
            SamplerMode::Test => "test",
        }
    }

    fn stream(&self) -> u64 {
        match self {
            SamplerMode::Train => 0,
            SamplerMode::Validate => 1,
            SamplerMode::Test => 2,
        }
    }
}

impl fmt::Display for SamplerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(SamplerMode::Train),
            "validate" => Ok(SamplerMode::Validate),
            "test" => Ok(SamplerMode::Test),
            other => anyhow::bail!(
                "Unsupported sampler mode '{}': must be one of train, validate, test",
                other
            ),
        }
    }
}

/// Draws batches of `[batch, length, alphabet]` sequences and `[batch, labels]` targets.
pub trait Sampler: Send {
    fn sample(&mut self, batch_size: usize) -> Result<Batch>;

    /// Reset the random state; loader workers call this with `seed + worker_id`.
    fn reseed(&mut self, seed: u64);

    fn mode(&self) -> SamplerMode;

    fn box_clone(&self) -> Box<dyn Sampler>;
}

impl Clone for Box<dyn Sampler> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

impl Sampler for Box<dyn Sampler> {
    fn sample(&mut self, batch_size: usize) -> Result<Batch> {
        (**self).sample(batch_size)
    }

    fn reseed(&mut self, seed: u64) {
        (**self).reseed(seed)
    }

    fn mode(&self) -> SamplerMode {
        (**self).mode()
    }

    fn box_clone(&self) -> Box<dyn Sampler> {
        (**self).box_clone()
    }
}

/// Sampler section of a run config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerConfig {
    Synthetic(SyntheticSamplerConfig),
}

impl SamplerConfig {
    /// Instantiate the sampler bound to `mode` and `seed`.
    pub fn build(&self, mode: SamplerMode, seed: u64) -> Result<Box<dyn Sampler>> {
        match self {
            SamplerConfig::Synthetic(cfg) => Ok(Box::new(SyntheticSampler::new(cfg.clone(), mode, seed)?)),
        }
    }

    pub fn sequence_length(&self) -> usize {
        match self {
            SamplerConfig::Synthetic(cfg) => cfg.sequence_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSamplerConfig {
    pub sequence_length: usize,
    pub n_targets: usize,
    /// Fraction of positions emitted as `N` (0.25 in every column)
    #[serde(default)]
    pub ambiguous_rate: f64,
    /// Probability that a label is 1
    #[serde(default = "default_positive_rate")]
    pub positive_rate: f64,
}

fn default_positive_rate() -> f64 {
    0.5
}

const DNA_ALPHABET: usize = 4;

/// One-hot DNA windows with random binary labels.
#[derive(Debug, Clone)]
pub struct SyntheticSampler {
    config: SyntheticSamplerConfig,
    mode: SamplerMode,
    rng: ChaCha8Rng,
}

impl SyntheticSampler {
    pub fn new(config: SyntheticSamplerConfig, mode: SamplerMode, seed: u64) -> Result<Self> {
        if config.sequence_length == 0 {
            anyhow::bail!("synthetic sampler sequence_length must be > 0");
        }
        if !(0.0..=1.0).contains(&config.ambiguous_rate) {
            anyhow::bail!("ambiguous_rate must be within [0, 1], got {}", config.ambiguous_rate);
        }
        if !(0.0..=1.0).contains(&config.positive_rate) {
            anyhow::bail!("positive_rate must be within [0, 1], got {}", config.positive_rate);
        }
        Ok(Self {
            rng: seeded_rng(seed, mode),
            config,
            mode,
        })
    }

    pub fn config(&self) -> &SyntheticSamplerConfig {
        &self.config
    }
}

fn seeded_rng(seed: u64, mode: SamplerMode) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(mode.stream());
    rng
}

impl Sampler for SyntheticSampler {
    fn sample(&mut self, batch_size: usize) -> Result<Batch> {
        let len = self.config.sequence_length;
        let mut sequences = Array3::<f32>::zeros((batch_size, len, DNA_ALPHABET));
        for mut row in sequences.rows_mut() {
            if self.rng.random_bool(self.config.ambiguous_rate) {
                row.fill(1.0 / DNA_ALPHABET as f32);
            } else {
                row[self.rng.random_range(0..DNA_ALPHABET)] = 1.0;
            }
        }

        let mut targets = Array2::<f32>::zeros((batch_size, self.config.n_targets));
        for t in targets.iter_mut() {
            if self.rng.random_bool(self.config.positive_rate) {
                *t = 1.0;
            }
        }
        Ok(Batch { sequences, targets })
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = seeded_rng(seed, self.mode);
    }

    fn mode(&self) -> SamplerMode {
        self.mode
    }

    fn box_clone(&self) -> Box<dyn Sampler> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;

    fn config() -> SyntheticSamplerConfig {
        SyntheticSamplerConfig {
            sequence_length: 50,
            n_targets: 7,
            ambiguous_rate: 0.1,
            positive_rate: 0.3,
        }
    }

    #[test]
    fn sample_shapes_and_one_hot_rows() {
        let mut sampler = SyntheticSampler::new(config(), SamplerMode::Train, 7).unwrap();
        let batch = sampler.sample(5).unwrap();
        assert_eq!(batch.sequences.shape(), &[5, 50, 4]);
        assert_eq!(batch.targets.shape(), &[5, 7]);
        for row in batch.sequences.lanes(Axis(2)) {
            let sum: f32 = row.sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(batch.targets.iter().all(|&t| t == 0.0 || t == 1.0));
    }

    #[test]
    fn same_seed_same_draws_and_modes_differ() {
        let mut a = SyntheticSampler::new(config(), SamplerMode::Train, 11).unwrap();
        let mut b = SyntheticSampler::new(config(), SamplerMode::Train, 11).unwrap();
        let mut v = SyntheticSampler::new(config(), SamplerMode::Validate, 11).unwrap();
        let first = a.sample(4).unwrap();
        assert_eq!(first, b.sample(4).unwrap());
        assert_ne!(first, v.sample(4).unwrap());

        a.reseed(11);
        assert_eq!(first, a.sample(4).unwrap());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("validate".parse::<SamplerMode>().unwrap(), SamplerMode::Validate);
        assert_eq!(SamplerMode::Test.to_string(), "test");
        assert!("training".parse::<SamplerMode>().is_err());
    }

    #[test]
    fn rejects_bad_rates() {
        let mut cfg = config();
        cfg.positive_rate = 1.5;
        assert!(SyntheticSampler::new(cfg, SamplerMode::Train, 0).is_err());
    }

    #[test]
    fn config_builds_boxed_sampler() {
        let cfg: SamplerConfig = serde_json::from_str(
            r#"{"kind": "synthetic", "sequence_length": 20, "n_targets": 3}"#,
        )
        .unwrap();
        assert_eq!(cfg.sequence_length(), 20);
        let mut sampler = cfg.build(SamplerMode::Test, 1).unwrap();
        assert_eq!(sampler.mode(), SamplerMode::Test);
        let mut copy = sampler.clone();
        assert_eq!(sampler.sample(2).unwrap(), copy.sample(2).unwrap());
    }
}
