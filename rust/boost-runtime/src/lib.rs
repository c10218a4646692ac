// rust/boost-runtime/src/lib.rs

//! Distributed Boost Runtime - Core Library
//!
//! Orchestrates round-based gradient boosting across worker partitions:
//! data preparation (missing-value filtering, ranking-group stitching,
//! co-partitioning), per-partition training matrices, rendezvous tracking,
//! and checkpointed training rounds.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::TrainingConfig;
pub use error::{BoostError, Result};
pub use storage::{LocalStorage, StorageBackend, StorageReader, StorageWriter};

pub mod checkpoint;
pub use checkpoint::{CheckpointManager, CheckpointReader, CheckpointWriter, CheckpointedModel};

pub mod data;
pub use data::{LabeledPoint, LabeledPointGroup, PartitionShard};

pub mod engine;
pub use engine::{CancelFlag, ClusterEngine, LocalCluster, Partitioned};

pub mod native;
pub use native::{Booster, MemoryBackend, NativeBackend, NativeMatrix};

pub mod tracker;
pub use tracker::{SocketTracker, SocketTrackerFactory, Tracker, TrackerClient, TrackerFactory};

pub mod watches;
pub use watches::{Watches, WatchesBuilder};

pub mod orchestrator;
pub use orchestrator::{Orchestrator, RoundState, TrainingData, TrainingOutcome};
