// src/h5_loader.rs
//
// Loader over a precomputed sequence file (see `genoload_formats::hdf5` for
// the layout). Files may be bit-packed and may be held in memory.

use anyhow::{Context, Result};
use genoload_formats::{apply_null_rule, unpack_bits, SequenceH5Reader, SEQUENCES_KEY, TARGETS_KEY};
use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::dataset::{Dataset, Sample};
use crate::loader::{DataLoader, IndexOrder, LoaderIter, LoaderOptions, ShardSpec};

/// Which rows of the file to iterate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subset {
    /// The first `n` rows
    Count(usize),
    /// Rows `start..end`
    Range { start: usize, end: usize },
    /// Exactly these rows
    Indices(Vec<usize>),
}

impl Subset {
    /// Concrete row indices, checked against the dataset length.
    pub fn resolve(&self, len: usize) -> Result<Vec<usize>> {
        match self {
            Subset::Count(n) => {
                if *n > len {
                    anyhow::bail!("subset of {} rows is larger than the dataset's {} rows", n, len);
                }
                Ok((0..*n).collect())
            }
            Subset::Range { start, end } => {
                if start > end {
                    anyhow::bail!("subset range start {} is after end {}", start, end);
                }
                if *end > len {
                    anyhow::bail!("subset range end {} is out of range for a dataset of {} rows", end, len);
                }
                Ok((*start..*end).collect())
            }
            Subset::Indices(indices) => {
                if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
                    anyhow::bail!("subset index {} is out of range for a dataset of {} rows", bad, len);
                }
                Ok(indices.clone())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H5DatasetOptions {
    /// Read both arrays fully on first use
    #[serde(default)]
    pub in_memory: bool,
    /// Stored arrays are bit-packed and must be expanded
    #[serde(default)]
    pub unpackbits: bool,
    #[serde(default = "default_sequence_key")]
    pub sequence_key: String,
    #[serde(default = "default_targets_key")]
    pub targets_key: String,
}

fn default_sequence_key() -> String {
    SEQUENCES_KEY.to_string()
}

fn default_targets_key() -> String {
    TARGETS_KEY.to_string()
}

impl Default for H5DatasetOptions {
    fn default() -> Self {
        Self {
            in_memory: false,
            unpackbits: false,
            sequence_key: default_sequence_key(),
            targets_key: default_targets_key(),
        }
    }
}

enum Rows {
    OnDisk,
    Packed { sequences: Array3<u8>, targets: Array2<u8> },
    Dense { sequences: Array3<f32>, targets: Array2<f32> },
}

struct OpenFile {
    reader: SequenceH5Reader,
    rows: Rows,
    /// Unpadded (sequence, targets) lengths, only read when unpacking
    lengths: Option<(usize, usize)>,
    len: usize,
}

/// Random access over the rows of a sequence file.
///
/// The file is opened lazily on first use. Clones start unopened, so every
/// loader worker opens its own handle.
pub struct H5Dataset {
    path: PathBuf,
    options: H5DatasetOptions,
    state: OnceLock<OpenFile>,
}

impl Clone for H5Dataset {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            options: self.options.clone(),
            state: OnceLock::new(),
        }
    }
}

impl H5Dataset {
    pub fn new<P: AsRef<Path>>(path: P, options: H5DatasetOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            state: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &H5DatasetOptions {
        &self.options
    }

    /// Number of rows, opening the file if needed.
    pub fn try_len(&self) -> Result<usize> {
        Ok(self.open()?.len)
    }

    fn open(&self) -> Result<&OpenFile> {
        if let Some(state) = self.state.get() {
            return Ok(state);
        }
        let reader = SequenceH5Reader::open(&self.path, &self.options.sequence_key, &self.options.targets_key)?;
        let len = reader.len();
        let lengths = if self.options.unpackbits {
            Some(reader.stored_lengths()?)
        } else {
            None
        };
        let rows = match (self.options.in_memory, self.options.unpackbits) {
            (false, _) => Rows::OnDisk,
            (true, true) => Rows::Packed {
                sequences: reader.read_all_sequences::<u8>()?,
                targets: reader.read_all_targets::<u8>()?,
            },
            (true, false) => Rows::Dense {
                sequences: reader.read_all_sequences::<f32>()?,
                targets: reader.read_all_targets::<f32>()?,
            },
        };
        debug!(
            "opened {:?}: {} rows, in_memory={}, unpackbits={}",
            self.path, len, self.options.in_memory, self.options.unpackbits
        );
        Ok(self.state.get_or_init(|| OpenFile { reader, rows, lengths, len }))
    }

    fn read_packed(&self, file: &OpenFile, index: usize) -> Result<(Array2<u8>, Array1<u8>)> {
        match &file.rows {
            Rows::Packed { sequences, targets } => Ok((
                sequences.index_axis(Axis(0), index).to_owned(),
                targets.index_axis(Axis(0), index).to_owned(),
            )),
            _ => Ok((file.reader.read_sequence::<u8>(index)?, file.reader.read_targets::<u8>(index)?)),
        }
    }

    fn read_dense(&self, file: &OpenFile, index: usize) -> Result<(Array2<f32>, Array1<f32>)> {
        match &file.rows {
            Rows::Dense { sequences, targets } => Ok((
                sequences.index_axis(Axis(0), index).to_owned(),
                targets.index_axis(Axis(0), index).to_owned(),
            )),
            _ => Ok((file.reader.read_sequence::<f32>(index)?, file.reader.read_targets::<f32>(index)?)),
        }
    }
}

impl Dataset for H5Dataset {
    /// 0 if the file cannot be opened; the error then surfaces from `get`.
    fn len(&self) -> usize {
        self.try_len().unwrap_or(0)
    }

    /// `index` wraps around the number of rows.
    fn get(&mut self, index: usize) -> Result<Sample> {
        let file = self.open()?;
        if file.len == 0 {
            anyhow::bail!("{:?} contains no rows", self.path);
        }
        let index = index % file.len;

        if let Some((seq_len, tgt_len)) = file.lengths {
            let (packed_seq, packed_tgt) = self.read_packed(file, index)?;
            let mut sequence = unpack_bits(&packed_seq.view(), Axis(0), seq_len)
                .with_context(|| format!("Failed to unpack sequence row {} of {:?}", index, self.path))?
                .mapv(f32::from);
            apply_null_rule(&mut sequence);
            let targets = unpack_bits(&packed_tgt.view(), Axis(0), tgt_len)
                .with_context(|| format!("Failed to unpack targets row {} of {:?}", index, self.path))?
                .mapv(f32::from);
            Ok(Sample { sequence, targets })
        } else {
            let (sequence, targets) = self.read_dense(file, index)?;
            Ok(Sample { sequence, targets })
        }
    }
}

/// Options for `H5DataLoader`.
#[derive(Debug, Clone, PartialEq)]
pub struct H5LoaderOptions {
    pub dataset: H5DatasetOptions,
    pub num_workers: usize,
    pub batch_size: usize,
    /// Ignored when `use_subset` is set (subsets are always drawn randomly)
    pub shuffle: bool,
    pub use_subset: Option<Subset>,
    pub seed: u64,
    pub prefetch_factor: usize,
    pub drop_last: bool,
}

impl Default for H5LoaderOptions {
    fn default() -> Self {
        Self {
            dataset: H5DatasetOptions::default(),
            num_workers: 1,
            batch_size: 1,
            shuffle: true,
            use_subset: None,
            seed: 436,
            prefetch_factor: 2,
            drop_last: false,
        }
    }
}

/// Batched, optionally parallel iteration over a sequence file.
pub struct H5DataLoader {
    inner: DataLoader<H5Dataset>,
}

impl H5DataLoader {
    /// Opens the file once to size the index order; workers reopen it.
    pub fn new<P: AsRef<Path>>(path: P, options: H5LoaderOptions) -> Result<Self> {
        let dataset = H5Dataset::new(path.as_ref(), options.dataset.clone());
        let len = dataset
            .try_len()
            .with_context(|| format!("Failed to size HDF5 dataset {:?}", path.as_ref()))?;

        let order = match &options.use_subset {
            Some(subset) => IndexOrder::SubsetRandom(subset.resolve(len)?),
            None if options.shuffle => IndexOrder::Shuffled { len },
            None => IndexOrder::Sequential { len },
        };
        info!("H5DataLoader over {:?}: {} rows, {} in order", path.as_ref(), len, order.len());

        let loader_options = LoaderOptions {
            batch_size: options.batch_size,
            num_workers: options.num_workers,
            prefetch_factor: options.prefetch_factor,
            seed: options.seed,
            drop_last: options.drop_last,
        };
        let inner = DataLoader::new(dataset, order, loader_options)?;
        Ok(Self { inner })
    }

    pub fn with_shard(self, shard: ShardSpec) -> Self {
        Self {
            inner: self.inner.with_shard(shard),
        }
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Rows visited per epoch (before sharding).
    pub fn num_samples(&self) -> usize {
        self.inner.order().len()
    }

    pub fn batch_size(&self) -> usize {
        self.inner.options().batch_size
    }

    pub fn dataset(&self) -> &H5Dataset {
        self.inner.dataset()
    }

    /// Make the next pass use the order of epoch `epoch`.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.inner.set_epoch(epoch);
    }

    pub fn iter(&mut self) -> Result<LoaderIter<'_, H5Dataset>> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_forms_resolve() {
        assert_eq!(Subset::Count(3).resolve(10).unwrap(), vec![0, 1, 2]);
        assert_eq!(Subset::Range { start: 4, end: 7 }.resolve(10).unwrap(), vec![4, 5, 6]);
        assert_eq!(Subset::Indices(vec![9, 1]).resolve(10).unwrap(), vec![9, 1]);
        assert!(Subset::Count(11).resolve(10).is_err());
        assert!(Subset::Range { start: 5, end: 2 }.resolve(10).is_err());
        assert!(Subset::Indices(vec![10]).resolve(10).is_err());
    }

    #[test]
    fn oversized_subsets_error_without_allocating() {
        assert!(Subset::Count(usize::MAX).resolve(10).is_err());
        assert!(Subset::Range { start: 0, end: usize::MAX }.resolve(10).is_err());
        assert_eq!(Subset::Count(10).resolve(10).unwrap().len(), 10);
        assert_eq!(Subset::Range { start: 10, end: 10 }.resolve(10).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn subset_parses_from_yaml_forms() {
        let count: Subset = serde_yaml::from_str("1000").unwrap();
        assert_eq!(count, Subset::Count(1000));
        let range: Subset = serde_yaml::from_str("{start: 10, end: 20}").unwrap();
        assert_eq!(range, Subset::Range { start: 10, end: 20 });
        let list: Subset = serde_yaml::from_str("[3, 5, 8]").unwrap();
        assert_eq!(list, Subset::Indices(vec![3, 5, 8]));
    }

    #[test]
    fn missing_file_reports_zero_len_and_errors_on_get() {
        let mut dataset = H5Dataset::new("/nonexistent/genoload/file.h5", H5DatasetOptions::default());
        assert_eq!(dataset.len(), 0);
        assert!(dataset.try_len().is_err());
        assert!(dataset.get(0).is_err());
        assert!(H5DataLoader::new("/nonexistent/genoload/file.h5", H5LoaderOptions::default()).is_err());
    }
}
