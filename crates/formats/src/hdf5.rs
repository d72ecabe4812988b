// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/formats/src/hdf5.rs
//
// Four-dataset HDF5 layout for sampled sequence data:
//   sequences        N x L' x A  (u8 when bit-packed, f32 otherwise)
//   targets          N x T'      (u8)
//   sequences_length scalar      (unpadded L)
//   targets_length   scalar      (unpadded T)

use anyhow::{Context, Result};
use hdf5_metno::{Dataset, File, H5Type};
use ndarray::{s, Array, Array1, Array2, ArrayView2, ArrayView3, Axis, Ix1, Ix2, Ix3};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::bitpack::pack_bits;
use crate::{length_key, LayoutShape, SEQUENCES_KEY, TARGETS_KEY};

/// Writes sampled batches into the sequence layout.
///
/// Datasets are created from the shape of the first batch; every later batch
/// must agree with it.
pub struct SequenceH5Writer {
    file: File,
    path: PathBuf,
    batch_size: usize,
    n_steps: usize,
    rows: usize,
    packbits: bool,
    sequence_key: String,
    targets_key: String,
    layout: Option<(LayoutShape, Dataset, Dataset)>,
}

impl SequenceH5Writer {
    /// Create (or truncate) `path` for `n_steps` batches of `batch_size` rows.
    pub fn create<P: AsRef<Path>>(path: P, batch_size: usize, n_steps: usize, packbits: bool) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        let rows = batch_size
            .checked_mul(n_steps)
            .with_context(|| format!("{} steps of {} rows overflow the row count", n_steps, batch_size))?;
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create HDF5 file at {:?}", path))?;

        Ok(Self {
            file,
            path,
            batch_size,
            n_steps,
            rows,
            packbits,
            sequence_key: SEQUENCES_KEY.to_string(),
            targets_key: TARGETS_KEY.to_string(),
            layout: None,
        })
    }

    /// Use custom dataset names instead of `sequences` / `targets`.
    pub fn with_keys(mut self, sequence_key: &str, targets_key: &str) -> Self {
        self.sequence_key = sequence_key.to_string();
        self.targets_key = targets_key.to_string();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layout once the first batch has been written.
    pub fn layout(&self) -> Option<LayoutShape> {
        self.layout.as_ref().map(|(shape, _, _)| *shape)
    }

    /// Store batch `step` in rows `[step * batch_size, (step + 1) * batch_size)`.
    pub fn write_batch(&mut self, step: usize, sequences: ArrayView3<'_, f32>, targets: ArrayView2<'_, f32>) -> Result<()> {
        if step >= self.n_steps {
            anyhow::bail!("step {} is outside the {} steps this file was created for", step, self.n_steps);
        }
        let rows = sequences.len_of(Axis(0));
        if rows != self.batch_size || targets.len_of(Axis(0)) != self.batch_size {
            anyhow::bail!(
                "batch at step {} has {} sequences and {} targets, expected {}",
                step,
                rows,
                targets.len_of(Axis(0)),
                self.batch_size
            );
        }

        let incoming = LayoutShape {
            rows: self.rows,
            sequence_length: sequences.len_of(Axis(1)),
            alphabet: sequences.len_of(Axis(2)),
            targets_length: targets.len_of(Axis(1)),
            packed: self.packbits,
        };
        if self.layout.is_none() {
            self.create_layout(incoming)?;
        }
        let Some((shape, seq_ds, tgt_ds)) = self.layout.as_ref() else {
            anyhow::bail!("HDF5 layout was not created");
        };
        if *shape != incoming {
            anyhow::bail!(
                "batch at step {} has shape {:?}, file was created with {:?}",
                step,
                incoming,
                shape
            );
        }

        let start = step * self.batch_size;
        let end = start + self.batch_size;
        if self.packbits {
            let packed_seq = pack_bits(&sequences, Axis(1));
            let packed_tgt = pack_bits(&targets, Axis(1));
            seq_ds
                .write_slice(&packed_seq, s![start..end, .., ..])
                .with_context(|| format!("Failed to write sequences rows {}..{}", start, end))?;
            tgt_ds
                .write_slice(&packed_tgt, s![start..end, ..])
                .with_context(|| format!("Failed to write targets rows {}..{}", start, end))?;
        } else {
            seq_ds
                .write_slice(&sequences, s![start..end, .., ..])
                .with_context(|| format!("Failed to write sequences rows {}..{}", start, end))?;
            let tgt = targets.mapv(|v| v as u8);
            tgt_ds
                .write_slice(&tgt, s![start..end, ..])
                .with_context(|| format!("Failed to write targets rows {}..{}", start, end))?;
        }
        debug!("wrote rows {}..{} to {:?}", start, end, self.path);
        Ok(())
    }

    fn create_layout(&mut self, shape: LayoutShape) -> Result<()> {
        write_scalar(&self.file, &length_key(&self.sequence_key), shape.sequence_length as u64)?;
        write_scalar(&self.file, &length_key(&self.targets_key), shape.targets_length as u64)?;

        let seq_dims = shape.sequences_dims().to_vec();
        let tgt_dims = shape.targets_dims().to_vec();
        let sequences = (if shape.packed {
            self.file.new_dataset::<u8>().shape(&seq_dims).create(self.sequence_key.as_str())
        } else {
            self.file.new_dataset::<f32>().shape(&seq_dims).create(self.sequence_key.as_str())
        })
        .with_context(|| format!("Failed to create dataset '{}'", self.sequence_key))?;

        let targets = self
            .file
            .new_dataset::<u8>()
            .shape(&tgt_dims)
            .create(self.targets_key.as_str())
            .with_context(|| format!("Failed to create dataset '{}'", self.targets_key))?;

        debug!("created layout {:?} in {:?}", shape, self.path);
        self.layout = Some((shape, sequences, targets));
        Ok(())
    }

    /// Flush and close the file.
    pub fn finish(self) -> Result<()> {
        self.file
            .flush()
            .with_context(|| format!("Failed to flush HDF5 file {:?}", self.path))?;
        Ok(())
    }
}

fn write_scalar(file: &File, name: &str, value: u64) -> Result<()> {
    let ds = file
        .new_dataset::<u64>()
        .shape(())
        .create(name)
        .with_context(|| format!("Failed to create scalar dataset '{}'", name))?;
    ds.write_scalar(&value)
        .with_context(|| format!("Failed to write scalar dataset '{}'", name))?;
    Ok(())
}

/// Random-access reader over the sequence layout.
pub struct SequenceH5Reader {
    file: File,
    path: PathBuf,
    sequence_key: String,
    targets_key: String,
    sequences: Dataset,
    targets: Dataset,
}

impl SequenceH5Reader {
    /// Open `path` read-only and resolve the two array datasets.
    pub fn open<P: AsRef<Path>>(path: P, sequence_key: &str, targets_key: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Failed to open HDF5 file at {:?}", path))?;
        let sequences = file
            .dataset(sequence_key)
            .with_context(|| format!("Failed to open dataset '{}' in {:?}", sequence_key, path))?;
        let targets = file
            .dataset(targets_key)
            .with_context(|| format!("Failed to open dataset '{}' in {:?}", targets_key, path))?;

        if sequences.ndim() != 3 {
            anyhow::bail!("dataset '{}' must be 3-dimensional, got shape {:?}", sequence_key, sequences.shape());
        }
        if targets.ndim() != 2 {
            anyhow::bail!("dataset '{}' must be 2-dimensional, got shape {:?}", targets_key, targets.shape());
        }
        if sequences.shape()[0] != targets.shape()[0] {
            anyhow::bail!(
                "'{}' has {} rows but '{}' has {}",
                sequence_key,
                sequences.shape()[0],
                targets_key,
                targets.shape()[0]
            );
        }

        Ok(Self {
            file,
            path,
            sequence_key: sequence_key.to_string(),
            targets_key: targets_key.to_string(),
            sequences,
            targets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows in the file.
    pub fn len(&self) -> usize {
        self.sequences.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequences_shape(&self) -> Vec<usize> {
        self.sequences.shape()
    }

    pub fn targets_shape(&self) -> Vec<usize> {
        self.targets.shape()
    }

    /// Unpadded `(sequence_length, targets_length)` recorded by the writer.
    pub fn stored_lengths(&self) -> Result<(usize, usize)> {
        let seq = self.read_length(&self.sequence_key)?;
        let tgt = self.read_length(&self.targets_key)?;
        Ok((seq, tgt))
    }

    fn read_length(&self, key: &str) -> Result<usize> {
        let name = length_key(key);
        let value: u64 = self
            .file
            .dataset(&name)
            .and_then(|ds| ds.read_scalar())
            .with_context(|| format!("Failed to read '{}' from {:?}", name, self.path))?;
        Ok(value as usize)
    }

    /// One sequence row (`L' x A`), converted to `T` by HDF5.
    pub fn read_sequence<T: H5Type>(&self, index: usize) -> Result<Array2<T>> {
        self.check_index(index)?;
        self.sequences
            .read_slice::<T, _, Ix2>(s![index, .., ..])
            .with_context(|| format!("Failed to read row {} of '{}'", index, self.sequence_key))
    }

    /// One targets row (`T'`), converted to `T` by HDF5.
    pub fn read_targets<T: H5Type>(&self, index: usize) -> Result<Array1<T>> {
        self.check_index(index)?;
        self.targets
            .read_slice::<T, _, Ix1>(s![index, ..])
            .with_context(|| format!("Failed to read row {} of '{}'", index, self.targets_key))
    }

    /// The whole `sequences` dataset.
    pub fn read_all_sequences<T: H5Type>(&self) -> Result<Array<T, Ix3>> {
        self.sequences
            .read::<T, Ix3>()
            .with_context(|| format!("Failed to read dataset '{}'", self.sequence_key))
    }

    /// The whole `targets` dataset.
    pub fn read_all_targets<T: H5Type>(&self) -> Result<Array<T, Ix2>> {
        self.targets
            .read::<T, Ix2>()
            .with_context(|| format!("Failed to read dataset '{}'", self.targets_key))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.len() {
            anyhow::bail!("row {} out of range for {} rows in {:?}", index, self.len(), self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use tempfile::TempDir;

    fn one_hot_batch(rows: usize, len: usize, offset: usize) -> (Array3<f32>, Array2<f32>) {
        let mut seqs = Array3::<f32>::zeros((rows, len, 4));
        let mut tgts = Array2::<f32>::zeros((rows, 3));
        for r in 0..rows {
            for l in 0..len {
                seqs[[r, l, (r + l + offset) % 4]] = 1.0;
            }
            tgts[[r, (r + offset) % 3]] = 1.0;
        }
        (seqs, tgts)
    }

    #[test]
    fn create_rejects_overflowing_row_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.h5");
        assert!(SequenceH5Writer::create(&path, usize::MAX, 2, true).is_err());
        assert!(SequenceH5Writer::create(&path, 0, 2, true).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn dense_write_and_read_rows() {
        if std::env::var("SKIP_HDF5_TESTS").is_ok() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dense.h5");

        let mut writer = SequenceH5Writer::create(&path, 2, 2, false).unwrap();
        let (s0, t0) = one_hot_batch(2, 5, 0);
        let (s1, t1) = one_hot_batch(2, 5, 1);
        writer.write_batch(0, s0.view(), t0.view()).unwrap();
        writer.write_batch(1, s1.view(), t1.view()).unwrap();
        writer.finish().unwrap();

        let reader = SequenceH5Reader::open(&path, SEQUENCES_KEY, TARGETS_KEY).unwrap();
        assert_eq!(reader.len(), 4);
        assert_eq!(reader.sequences_shape(), vec![4, 5, 4]);
        assert_eq!(reader.stored_lengths().unwrap(), (5, 3));
        assert_eq!(reader.read_sequence::<f32>(3).unwrap(), s1.index_axis(Axis(0), 1));
        assert_eq!(reader.read_targets::<f32>(2).unwrap(), t1.index_axis(Axis(0), 0));
        assert!(reader.read_sequence::<f32>(4).is_err());
    }

    #[test]
    fn packed_write_records_true_lengths() {
        if std::env::var("SKIP_HDF5_TESTS").is_ok() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("packed.h5");

        let mut writer = SequenceH5Writer::create(&path, 3, 1, true).unwrap();
        let (s0, t0) = one_hot_batch(3, 10, 2);
        writer.write_batch(0, s0.view(), t0.view()).unwrap();
        assert_eq!(writer.layout().unwrap().sequences_dims(), [3, 2, 4]);
        writer.finish().unwrap();

        let reader = SequenceH5Reader::open(&path, SEQUENCES_KEY, TARGETS_KEY).unwrap();
        assert_eq!(reader.sequences_shape(), vec![3, 2, 4]);
        assert_eq!(reader.targets_shape(), vec![3, 1]);
        assert_eq!(reader.stored_lengths().unwrap(), (10, 3));

        let row = reader.read_sequence::<u8>(1).unwrap();
        let unpacked = crate::unpack_bits(&row.view(), Axis(0), 10).unwrap();
        assert_eq!(unpacked.mapv(f32::from), s0.index_axis(Axis(0), 1));
    }

    #[test]
    fn rejects_batches_that_disagree_with_the_layout() {
        if std::env::var("SKIP_HDF5_TESTS").is_ok() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mismatch.h5");

        let mut writer = SequenceH5Writer::create(&path, 2, 3, false).unwrap();
        let (s0, t0) = one_hot_batch(2, 5, 0);
        writer.write_batch(0, s0.view(), t0.view()).unwrap();

        let (longer, t1) = one_hot_batch(2, 6, 0);
        assert!(writer.write_batch(1, longer.view(), t1.view()).is_err());

        let (short_batch, t2) = one_hot_batch(1, 5, 0);
        assert!(writer.write_batch(1, short_batch.view(), t2.view()).is_err());

        assert!(writer.write_batch(3, s0.view(), t0.view()).is_err());
    }
}
