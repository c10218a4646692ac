// rust/boost-runtime/src/engine/partitioned.rs

//! Partitioned collections.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::{BoostError, Result};

/// A collection split into an ordered list of partitions.
///
/// Partition `i` is the slice of data handed to worker task `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct Partitioned<T> {
    partitions: Vec<Vec<T>>,
}

impl<T> Partitioned<T> {
    pub fn from_partitions(partitions: Vec<Vec<T>>) -> Self {
        Self { partitions }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Number of elements in every partition.
    pub fn partition_sizes(&self) -> Vec<usize> {
        self.partitions.iter().map(Vec::len).collect()
    }

    pub fn total_len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn into_partitions(self) -> Vec<Vec<T>> {
        self.partitions
    }

    /// Redistributes the elements over exactly `n` partitions.
    ///
    /// Source partition `p` deals its elements round-robin, starting at an
    /// offset drawn from a generator seeded with `p`. The result depends on
    /// partition sizes only, never on element content. Returns `self` when it
    /// already has `n` partitions.
    pub fn repartition(self, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(BoostError::config(
                "cannot repartition into 0 partitions",
            ));
        }
        if self.partitions.len() == n {
            return Ok(self);
        }

        let total = self.total_len();
        let mut out: Vec<Vec<T>> = (0..n).map(|_| Vec::with_capacity(total / n + 1)).collect();

        for (source, items) in self.partitions.into_iter().enumerate() {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(source as u64);
            let mut target = rng.gen_range(0..n);
            for item in items {
                out[target].push(item);
                target = (target + 1) % n;
            }
        }

        Ok(Self { partitions: out })
    }

    /// Applies `f` once per partition.
    pub fn map_partitions<U, F>(self, mut f: F) -> Partitioned<U>
    where
        F: FnMut(usize, Vec<T>) -> Vec<U>,
    {
        Partitioned {
            partitions: self
                .partitions
                .into_iter()
                .enumerate()
                .map(|(i, part)| f(i, part))
                .collect(),
        }
    }

    /// Applies a fallible `f` once per partition, stopping at the first error.
    pub fn try_map_partitions<U, F>(self, mut f: F) -> Result<Partitioned<U>>
    where
        F: FnMut(usize, Vec<T>) -> Result<Vec<U>>,
    {
        let partitions = self
            .partitions
            .into_iter()
            .enumerate()
            .map(|(i, part)| f(i, part))
            .collect::<Result<Vec<_>>>()?;
        Ok(Partitioned { partitions })
    }

    /// Pairs partition `i` of `self` with partition `i` of `other`.
    ///
    /// Both collections must have the same number of partitions.
    pub fn zip_partitions<U, V, F>(self, other: Partitioned<U>, mut f: F) -> Result<Partitioned<V>>
    where
        F: FnMut(usize, Vec<T>, Vec<U>) -> Vec<V>,
    {
        if self.partitions.len() != other.partitions.len() {
            return Err(BoostError::config(format!(
                "cannot zip collections with {} and {} partitions",
                self.partitions.len(),
                other.partitions.len()
            )));
        }

        Ok(Partitioned {
            partitions: self
                .partitions
                .into_iter()
                .zip(other.partitions)
                .enumerate()
                .map(|(i, (left, right))| f(i, left, right))
                .collect(),
        })
    }
}
