// rust/boost-runtime/src/data/mod.rs

//! Instance model and the partition-preparation pipeline.
//!
//! Points flow through these stages before a worker ever sees them:
//!
//! 1. [`filter_missing`] strips missing-value entries from every point.
//! 2. For ranking objectives, [`aggregate_groups`] turns each partition into
//!    groups and stitches groups cut by partition boundaries.
//! 3. [`co_partition`] / [`co_partition_groups`] resize the training set and
//!    every eval set to the worker count and zip them into one
//!    [`PartitionShard`] per worker.

mod groups;
mod missing;
mod partition;
mod point;

pub use groups::{aggregate_groups, stitch_edge_groups, GroupIterator};
pub use missing::{filter_missing, MissingValueFilter};
pub use partition::{co_partition, co_partition_groups, PartitionShard, ShardData};
pub use point::{LabeledPoint, LabeledPointGroup, NO_GROUP};
