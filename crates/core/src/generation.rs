// src/generation.rs
//
// Write sampled batches to an HDF5 file that `H5DataLoader` can read back.

use anyhow::{Context, Result};
use genoload_formats::SequenceH5Writer;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::sampler::{Sampler, SamplerMode};

const PROGRESS_EVERY: usize = 50;

/// `<mode>_seed=<seed>_N=<rows>.h5`
pub fn sampled_h5_file_name(mode: SamplerMode, seed: u64, rows: usize) -> String {
    format!("{}_seed={}_N={}.h5", mode, seed, rows)
}

/// Draw `n_steps` batches from the configured sampler bound to `mode` and
/// `seed`, and store them under `config.output_dir`. Returns the file path.
pub fn write_sampled_h5(
    config: &RunConfig,
    mode: SamplerMode,
    n_steps: usize,
    seed: u64,
    packbits: bool,
) -> Result<PathBuf> {
    let sampler_config = config
        .sampler
        .as_ref()
        .context("write-h5 needs a `sampler` section in the config")?;
    let batch_size = config.write_batch_size();
    if batch_size == 0 {
        anyhow::bail!("batch_size must be > 0");
    }
    if n_steps == 0 {
        anyhow::bail!("n_steps must be > 0");
    }
    let rows = batch_size
        .checked_mul(n_steps)
        .context("batch_size * n_steps overflows")?;

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", config.output_dir))?;
    let path = config.output_dir.join(sampled_h5_file_name(mode, seed, rows));

    let mut sampler = sampler_config.build(mode, seed)?;
    let mut writer = SequenceH5Writer::create(&path, batch_size, n_steps, packbits)?;
    info!(
        "Writing {} {} rows to {:?} (batch_size={}, packbits={})",
        rows, mode, path, batch_size, packbits
    );

    let start = Instant::now();
    for step in 0..n_steps {
        let batch = sampler
            .sample(batch_size)
            .with_context(|| format!("Sampler failed at step {}", step))?;
        writer
            .write_batch(step, batch.sequences.view(), batch.targets.view())
            .with_context(|| format!("Failed to write step {} to {:?}", step, path))?;
        if step % PROGRESS_EVERY == 0 {
            info!("step {}/{} written", step, n_steps);
        }
    }
    writer.finish()?;
    debug!("wrote {:?} in {:?}", path, start.elapsed());

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_encodes_mode_seed_and_rows() {
        assert_eq!(sampled_h5_file_name(SamplerMode::Validate, 7, 640), "validate_seed=7_N=640.h5");
    }

    #[test]
    fn requires_a_sampler_and_positive_steps() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("ops: [validate]\noutput_dir: {}\n", dir.path().display());
        let config = RunConfig::from_yaml(&yaml).unwrap();
        assert!(write_sampled_h5(&config, SamplerMode::Train, 1, 0, false).is_err());

        let yaml = format!(
            "output_dir: {}\nsampler: {{kind: synthetic, sequence_length: 8, n_targets: 2}}\n",
            dir.path().display()
        );
        let config = RunConfig::from_yaml(&yaml).unwrap();
        assert!(write_sampled_h5(&config, SamplerMode::Train, 0, 0, false).is_err());
    }

    #[test]
    fn writes_expected_rows() {
        if std::env::var("SKIP_HDF5_TESTS").is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "output_dir: {}\nbatch_size: 4\nsampler: {{kind: synthetic, sequence_length: 12, n_targets: 3}}\n",
            dir.path().display()
        );
        let config = RunConfig::from_yaml(&yaml).unwrap();
        let path = write_sampled_h5(&config, SamplerMode::Test, 3, 5, true).unwrap();
        assert!(path.ends_with("test_seed=5_N=12.h5"));

        let reader = genoload_formats::SequenceH5Reader::open(&path, "sequences", "targets").unwrap();
        assert_eq!(reader.len(), 12);
        assert_eq!(reader.stored_lengths().unwrap(), (12, 3));
        assert_eq!(reader.sequences_shape(), vec![12, 2, 4]);
    }
}
