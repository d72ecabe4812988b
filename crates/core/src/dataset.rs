// src/dataset.rs
//
// Tensor types and the dataset interface the loader drives.
//
use anyhow::{Context, Result};
use ndarray::{s, stack, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

/// One item without a batch dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `[length, alphabet]`
    pub sequence: Array2<f32>,
    /// `[labels]`
    pub targets: Array1<f32>,
}

/// A collated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[batch, length, alphabet]`
    pub sequences: Array3<f32>,
    /// `[batch, labels]`
    pub targets: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.sequences.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row `index` of the batch.
    pub fn sample(&self, index: usize) -> Option<Sample> {
        if index >= self.len() || index >= self.targets.len_of(Axis(0)) {
            return None;
        }
        Some(Sample {
            sequence: self.sequences.index_axis(Axis(0), index).to_owned(),
            targets: self.targets.index_axis(Axis(0), index).to_owned(),
        })
    }

    /// The first `rows` rows (all of them if the batch is shorter).
    pub fn head(&self, rows: usize) -> Batch {
        let rows = rows.min(self.len());
        Batch {
            sequences: self.sequences.slice(s![..rows, .., ..]).to_owned(),
            targets: self.targets.slice(s![..rows, ..]).to_owned(),
        }
    }

    /// Size of the f32 payload in bytes.
    pub fn nbytes(&self) -> usize {
        (self.sequences.len() + self.targets.len()) * std::mem::size_of::<f32>()
    }
}

/// Map-style dataset: a length plus random access by index.
///
/// Each loader worker owns its own copy (via `Clone` on the concrete type),
/// so implementations may keep per-worker state such as open file handles.
pub trait Dataset: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch one item, without the batch dimension.
    fn get(&mut self, index: usize) -> Result<Sample>;

    /// Fetch several items as one batch.
    fn get_batch(&mut self, indices: &[usize]) -> Result<Batch> {
        let samples = indices
            .iter()
            .map(|&i| self.get(i))
            .collect::<Result<Vec<_>>>()?;
        collate(&samples)
    }

    /// Called once in each worker before it loads anything.
    fn worker_init(&mut self, _info: WorkerInfo) -> Result<()> {
        Ok(())
    }
}

/// Identity of the worker a dataset copy lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: usize,
    /// 0 when loading happens on the calling thread
    pub num_workers: usize,
    /// Number of `iter()` calls made on the loader before this one
    pub epoch: u64,
}

/// Stack samples along a new leading axis.
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    if samples.is_empty() {
        anyhow::bail!("cannot collate an empty list of samples");
    }
    let seq_views: Vec<ArrayView2<'_, f32>> = samples.iter().map(|s| s.sequence.view()).collect();
    let tgt_views: Vec<ArrayView1<'_, f32>> = samples.iter().map(|s| s.targets.view()).collect();

    let sequences = stack(Axis(0), &seq_views).with_context(|| {
        format!(
            "sequence shapes differ within batch (first is {:?})",
            samples[0].sequence.shape()
        )
    })?;
    let targets = stack(Axis(0), &tgt_views).with_context(|| {
        format!(
            "target shapes differ within batch (first is {:?})",
            samples[0].targets.shape()
        )
    })?;

    Ok(Batch { sequences, targets })
}
