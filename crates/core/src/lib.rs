//! Core library for genoload ─ sampler and HDF5 backed data loading for genomic sequence models.

pub mod config;
pub mod dataset;
pub mod generation;
pub mod h5_loader;
pub mod loader;
pub mod metrics;
pub mod runner;
pub mod sampler;
pub mod sampler_loader;

pub use config::{RunConfig, RunOverrides};
pub use dataset::{Batch, Dataset, Sample, WorkerInfo};
pub use generation::write_sampled_h5;
pub use h5_loader::{H5DataLoader, H5Dataset, H5DatasetOptions, H5LoaderOptions, Subset};
pub use loader::{DataLoader, LoaderOptions, ShardSpec};
pub use metrics::Metrics;
pub use runner::{parse_configs_and_run, LoaderBench, RunReport, Trainer};
pub use sampler::{Sampler, SamplerConfig, SamplerMode, SyntheticSampler, SyntheticSamplerConfig};
pub use sampler_loader::{SamplerDataLoader, SamplerDataset, SamplerLoaderOptions};
