// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/core/src/config/run_config.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::h5_loader::{H5DatasetOptions, H5LoaderOptions, Subset};
use crate::loader::{LoaderOptions, ShardSpec};
use crate::sampler::{SamplerConfig, SamplerMode};
use crate::sampler_loader::SamplerLoaderOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_ops")]
    pub ops: Vec<Op>,                       // executed in order
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    pub lr: Option<f64>,                    // CLI --lr wins
    pub sampler: Option<SamplerConfig>,     // on-the-fly source
    pub batch_size: Option<usize>,          // batch size for write-h5; falls back to loader.batch_size
    pub data: Option<DataConfig>,           // precomputed source; takes priority over sampler
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub train_model: TrainModelConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Train,
    Validate,
    Evaluate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataConfig {
    pub train: Option<H5SourceConfig>,
    pub validate: Option<H5SourceConfig>,
    pub test: Option<H5SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct H5SourceConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub dataset: H5DatasetOptions,
    pub use_subset: Option<Subset>,
    pub shuffle: Option<bool>,              // overrides loader.shuffle for this source
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_loader_seed")]
    pub seed: u64,
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default)]
    pub drop_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainModelConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_report_every")]
    pub report_stats_every_n_steps: usize,
    pub n_validation_samples: Option<usize>,
    pub n_test_samples: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default)]
    pub rank: usize,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    pub gpu: Option<usize>,
}

/// Command-line overrides; any `Some` replaces the config value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub lr: Option<f64>,
    pub rank: Option<usize>,
    pub world_size: Option<usize>,
    pub gpu: Option<usize>,
}

fn default_ops() -> Vec<Op> {
    vec![Op::Train]
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_random_seed() -> u64 {
    1447
}
fn default_batch_size() -> usize {
    64
}
fn default_num_workers() -> usize {
    1
}
fn default_loader_seed() -> u64 {
    436
}
fn default_prefetch_factor() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_max_steps() -> usize {
    1000
}
fn default_report_every() -> usize {
    100
}
fn default_world_size() -> usize {
    1
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            seed: default_loader_seed(),
            prefetch_factor: default_prefetch_factor(),
            shuffle: true,
            drop_last: false,
        }
    }
}

impl Default for TrainModelConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            report_stats_every_n_steps: default_report_every(),
            n_validation_samples: None,
            n_test_samples: None,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: default_world_size(),
            gpu: None,
        }
    }
}

impl RunConfig {
    /// Parse run config from JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| anyhow::anyhow!("Failed to parse JSON config: {}", e))
    }

    /// Parse run config from YAML string by converting to JSON first
    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        let yaml_value: serde_yaml::Value =
            serde_yaml::from_str(yaml_str).map_err(|e| anyhow::anyhow!("Failed to parse YAML: {}", e))?;

        let json_str =
            serde_json::to_string(&yaml_value).map_err(|e| anyhow::anyhow!("Failed to convert YAML to JSON: {}", e))?;

        Self::from_json(&json_str)
    }

    /// Load RunConfig from YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path.as_ref(), e))?;
        Self::from_yaml(&text)
    }

    /// Apply command-line overrides. Nothing changes unless the result validates.
    pub fn apply_overrides(&mut self, overrides: &RunOverrides) -> Result<()> {
        let mut updated = self.clone();
        if let Some(lr) = overrides.lr {
            if !lr.is_finite() || lr <= 0.0 {
                anyhow::bail!("learning rate must be a positive number, got {}", lr);
            }
            updated.lr = Some(lr);
        }
        if let Some(rank) = overrides.rank {
            updated.distributed.rank = rank;
        }
        if let Some(world_size) = overrides.world_size {
            updated.distributed.world_size = world_size;
        }
        if let Some(gpu) = overrides.gpu {
            updated.distributed.gpu = Some(gpu);
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ops.is_empty() {
            anyhow::bail!("ops must list at least one of train, validate, evaluate");
        }
        if let Some(lr) = self.lr {
            if !lr.is_finite() || lr <= 0.0 {
                anyhow::bail!("lr must be a positive number, got {}", lr);
            }
        }
        if self.ops.contains(&Op::Train) && self.lr.is_none() {
            anyhow::bail!("lr must be set in the config or with --lr when ops include train");
        }
        if self.data.is_none() && self.sampler.is_none() {
            anyhow::bail!("config needs either a `data` section or a `sampler` section");
        }
        if self.train_model.report_stats_every_n_steps == 0 {
            anyhow::bail!("train_model.report_stats_every_n_steps must be > 0");
        }
        self.shard()?;
        self.loader_options().validate()
    }

    pub fn shard(&self) -> Result<ShardSpec> {
        ShardSpec::new(self.distributed.rank, self.distributed.world_size)
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            batch_size: self.loader.batch_size,
            num_workers: self.loader.num_workers,
            prefetch_factor: self.loader.prefetch_factor,
            seed: self.loader.seed,
            drop_last: self.loader.drop_last,
        }
    }

    /// Options for a sampler-backed loader on this rank.
    pub fn sampler_loader_options(&self) -> SamplerLoaderOptions {
        SamplerLoaderOptions {
            num_workers: self.loader.num_workers,
            batch_size: self.loader.batch_size,
            seed: self.loader.seed.wrapping_add((self.distributed.rank as u64) << 32),
            prefetch_factor: self.loader.prefetch_factor,
        }
    }

    /// Options for an HDF5-backed loader reading `source`.
    pub fn h5_loader_options(&self, source: &H5SourceConfig) -> H5LoaderOptions {
        H5LoaderOptions {
            dataset: source.dataset.clone(),
            num_workers: self.loader.num_workers,
            batch_size: self.loader.batch_size,
            shuffle: source.shuffle.unwrap_or(self.loader.shuffle),
            use_subset: source.use_subset.clone(),
            seed: self.loader.seed,
            prefetch_factor: self.loader.prefetch_factor,
            drop_last: self.loader.drop_last,
        }
    }

    /// Precomputed source for `mode`, if configured.
    pub fn h5_source(&self, mode: SamplerMode) -> Option<&H5SourceConfig> {
        let data = self.data.as_ref()?;
        match mode {
            SamplerMode::Train => data.train.as_ref(),
            SamplerMode::Validate => data.validate.as_ref(),
            SamplerMode::Test => data.test.as_ref(),
        }
    }

    /// Rows per write-h5 step.
    pub fn write_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(self.loader.batch_size)
    }
}
