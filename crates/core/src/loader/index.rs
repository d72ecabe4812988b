// src/loader/index.rs
//
// Per-epoch index orders, rank sharding and batch grouping.

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// How dataset indices are visited within one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOrder {
    /// `0..len` in order; never materialised, so `len` may be `usize::MAX`
    Sequential { len: usize },
    /// A fresh permutation of `0..len` each epoch
    Shuffled { len: usize },
    /// A fresh permutation of exactly these indices each epoch
    SubsetRandom(Vec<usize>),
}

/// Which slice of the index order this process sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self { rank: 0, world_size: 1 }
    }
}

impl ShardSpec {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            anyhow::bail!("world_size must be >= 1");
        }
        if rank >= world_size {
            anyhow::bail!("Rank {} >= world_size {}", rank, world_size);
        }
        Ok(Self { rank, world_size })
    }

    /// Number of indices this rank sees out of `total` (padded by wrap-around).
    pub fn shard_len(&self, total: usize) -> usize {
        if self.world_size == 1 {
            total
        } else {
            total / self.world_size + usize::from(total % self.world_size != 0)
        }
    }
}

impl IndexOrder {
    /// Number of indices in one epoch before sharding.
    pub fn len(&self) -> usize {
        match self {
            IndexOrder::Sequential { len } | IndexOrder::Shuffled { len } => *len,
            IndexOrder::SubsetRandom(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices for `epoch`, restricted to `shard`. Permutations use a
    /// generator seeded with `seed + epoch`.
    pub fn epoch_indices(&self, seed: u64, epoch: u64, shard: ShardSpec) -> Box<dyn Iterator<Item = usize> + Send> {
        match self {
            IndexOrder::Sequential { len } => shard_lazy(*len, shard),
            IndexOrder::Shuffled { len } => {
                let mut order: Vec<usize> = (0..*len).collect();
                order.shuffle(&mut epoch_rng(seed, epoch));
                shard_vec(order, shard)
            }
            IndexOrder::SubsetRandom(indices) => {
                let mut order = indices.clone();
                order.shuffle(&mut epoch_rng(seed, epoch));
                shard_vec(order, shard)
            }
        }
    }
}

fn epoch_rng(seed: u64, epoch: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch))
}

fn shard_lazy(len: usize, shard: ShardSpec) -> Box<dyn Iterator<Item = usize> + Send> {
    if shard.world_size == 1 {
        return Box::new(0..len);
    }
    // Pad to a multiple of world_size unless that would overflow (an
    // unbounded order never runs out anyway).
    let total = shard
        .shard_len(len)
        .checked_mul(shard.world_size)
        .unwrap_or(len);
    Box::new((shard.rank..total).step_by(shard.world_size).map(move |i| i % len))
}

fn shard_vec(mut order: Vec<usize>, shard: ShardSpec) -> Box<dyn Iterator<Item = usize> + Send> {
    if shard.world_size == 1 || order.is_empty() {
        return Box::new(order.into_iter());
    }
    let total = shard.shard_len(order.len()) * shard.world_size;
    let mut i = 0;
    while order.len() < total {
        order.push(order[i]);
        i += 1;
    }
    Box::new(order.into_iter().skip(shard.rank).step_by(shard.world_size))
}

/// Groups an index stream into batches of `batch_size`.
pub struct BatchIndices<I> {
    inner: I,
    batch_size: usize,
    drop_last: bool,
}

impl<I> BatchIndices<I> {
    pub fn new(inner: I, batch_size: usize, drop_last: bool) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            drop_last,
        }
    }
}

impl<I: Iterator<Item = usize>> Iterator for BatchIndices<I> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let batch: Vec<usize> = self.inner.by_ref().take(self.batch_size).collect();
        if batch.is_empty() || (self.drop_last && batch.len() < self.batch_size) {
            None
        } else {
            Some(batch)
        }
    }
}

/// Number of batches `n` indices produce.
pub fn batch_count(n: usize, batch_size: usize, drop_last: bool) -> usize {
    let batch_size = batch_size.max(1);
    if drop_last {
        n / batch_size
    } else {
        n / batch_size + usize::from(n % batch_size != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_is_lazy_for_unbounded_orders() {
        let order = IndexOrder::Sequential { len: usize::MAX };
        let first: Vec<usize> = order.epoch_indices(0, 0, ShardSpec::default()).take(3).collect();
        assert_eq!(first, vec![0, 1, 2]);

        let shard = ShardSpec::new(1, 2).unwrap();
        let odd: Vec<usize> = order.epoch_indices(0, 0, shard).take(3).collect();
        assert_eq!(odd, vec![1, 3, 5]);
    }

    #[test]
    fn shuffled_is_a_seeded_permutation() {
        let order = IndexOrder::Shuffled { len: 100 };
        let a: Vec<usize> = order.epoch_indices(3, 0, ShardSpec::default()).collect();
        let b: Vec<usize> = order.epoch_indices(3, 0, ShardSpec::default()).collect();
        let next_epoch: Vec<usize> = order.epoch_indices(3, 1, ShardSpec::default()).collect();
        assert_eq!(a, b);
        assert_ne!(a, next_epoch);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn subset_only_yields_subset_members() {
        let order = IndexOrder::SubsetRandom(vec![10, 11, 12, 13]);
        let mut seen: Vec<usize> = order.epoch_indices(0, 0, ShardSpec::default()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![10, 11, 12, 13]);
    }

    #[test]
    fn shards_partition_with_equal_counts() {
        let order = IndexOrder::Sequential { len: 10 };
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| {
                order
                    .epoch_indices(0, 0, ShardSpec::new(rank, 3).unwrap())
                    .collect()
            })
            .collect();
        assert!(shards.iter().all(|s| s.len() == 4));
        assert_eq!(shards[0], vec![0, 3, 6, 9]);
        // wrap-around padding
        assert_eq!(shards[1], vec![1, 4, 7, 0]);
        assert_eq!(shards[2], vec![2, 5, 8, 1]);

        let shuffled = IndexOrder::Shuffled { len: 10 };
        let mut all: Vec<usize> = (0..3)
            .flat_map(|rank| shuffled.epoch_indices(5, 0, ShardSpec::new(rank, 3).unwrap()))
            .collect();
        assert_eq!(all.len(), 12);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shard_spec_validation() {
        assert!(ShardSpec::new(2, 2).is_err());
        assert!(ShardSpec::new(0, 0).is_err());
        assert_eq!(ShardSpec::new(1, 4).unwrap().shard_len(9), 3);
    }

    #[test]
    fn batches_honour_drop_last() {
        let keep: Vec<Vec<usize>> = BatchIndices::new(0..7, 3, false).collect();
        assert_eq!(keep, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        let drop: Vec<Vec<usize>> = BatchIndices::new(0..7, 3, true).collect();
        assert_eq!(drop.len(), 2);
        assert_eq!(batch_count(7, 3, false), 3);
        assert_eq!(batch_count(7, 3, true), 2);
    }
}
