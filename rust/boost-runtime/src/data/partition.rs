// rust/boost-runtime/src/data/partition.rs

//! Alignment of the training set and eval sets onto worker partitions.

use crate::config::{validate_eval_names, TRAIN_NAME};
use crate::engine::Partitioned;
use crate::error::{BoostError, Result};

use super::point::{LabeledPoint, LabeledPointGroup};

/// One dataset's slice inside a partition shard.
#[derive(Debug, Clone)]
pub enum ShardData {
    Points(Vec<LabeledPoint>),
    Groups(Vec<LabeledPointGroup>),
}

impl ShardData {
    /// Number of rows (for groups, the number of groups).
    pub fn len(&self) -> usize {
        match self {
            Self::Points(points) => points.len(),
            Self::Groups(groups) => groups.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything one worker task trains and evaluates on.
///
/// `datasets` always starts with the training set, followed by the eval sets
/// in the order they were supplied.
#[derive(Debug, Clone)]
pub struct PartitionShard {
    pub partition: usize,
    pub datasets: Vec<(String, ShardData)>,
}

impl PartitionShard {
    /// Checks that every dataset has at least one row in this partition.
    ///
    /// Workers call this before touching the data, so the check happens per
    /// partition when the shard is consumed.
    pub fn into_validated(self) -> Result<Self> {
        for (name, data) in &self.datasets {
            if !data.is_empty() {
                continue;
            }
            if name == TRAIN_NAME {
                return Err(BoostError::partition(
                    self.partition,
                    "detected an empty partition in the training data",
                ));
            }
            return Err(BoostError::partition(
                self.partition,
                format!(
                    "too few elements in eval set '{name}': this partition is empty, \
                     so the set has fewer rows than there are workers"
                ),
            ));
        }
        Ok(self)
    }

    pub fn dataset(&self, name: &str) -> Option<&ShardData> {
        self.datasets.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }
}

/// Co-partitions flat point sets onto `num_workers` partitions.
pub fn co_partition(
    train: Partitioned<LabeledPoint>,
    evals: Vec<(String, Partitioned<LabeledPoint>)>,
    num_workers: usize,
) -> Result<Partitioned<PartitionShard>> {
    co_partition_with(train, evals, num_workers, ShardData::Points)
}

/// Co-partitions stitched group sets onto `num_workers` partitions.
pub fn co_partition_groups(
    train: Partitioned<LabeledPointGroup>,
    evals: Vec<(String, Partitioned<LabeledPointGroup>)>,
    num_workers: usize,
) -> Result<Partitioned<PartitionShard>> {
    co_partition_with(train, evals, num_workers, ShardData::Groups)
}

fn co_partition_with<T>(
    train: Partitioned<T>,
    evals: Vec<(String, Partitioned<T>)>,
    num_workers: usize,
    wrap: fn(Vec<T>) -> ShardData,
) -> Result<Partitioned<PartitionShard>> {
    validate_eval_names(evals.iter().map(|(name, _)| name.as_str()))?;

    let mut shards = train
        .repartition(num_workers)?
        .map_partitions(|partition, rows| {
            vec![PartitionShard {
                partition,
                datasets: vec![(TRAIN_NAME.to_string(), wrap(rows))],
            }]
        });

    for (name, eval) in evals {
        let eval = eval.repartition(num_workers)?;
        shards = shards.zip_partitions(eval, |_, mut shard, rows| {
            if let Some(shard) = shard.first_mut() {
                shard.datasets.push((name.clone(), wrap(rows)));
            }
            shard
        })?;
    }

    Ok(shards)
}
