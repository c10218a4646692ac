// rust/boost-runtime/src/checkpoint/mod.rs

//! Model checkpoints between training segments.
//!
//! This module provides:
//! - Writing model snapshots with compression (none, lz4, zstd)
//! - Reading and verifying them via XXHash64 checksums
//! - Atomic writes so a crash never leaves a partial checkpoint
//! - A [`CheckpointManager`] that versions snapshots by completed round,
//!   computes resume boundaries and prunes old versions
//!
//! # Example
//!
//! ```no_run
//! use boost_runtime::checkpoint::CheckpointManager;
//! use boost_runtime::config::{CheckpointConfig, StorageConfig};
//! use boost_runtime::native::Booster;
//! use boost_runtime::storage::{LocalStorage, StorageBackend};
//! use std::sync::Arc;
//!
//! let storage: Arc<dyn StorageBackend> =
//!     Arc::new(LocalStorage::new(&StorageConfig::default()).unwrap());
//! let manager =
//!     CheckpointManager::new(storage, "checkpoints", &CheckpointConfig::default()).unwrap();
//!
//! manager.update_checkpoint(&Booster::from_bytes(b"model".to_vec()), 10).unwrap();
//! let latest = manager.load_latest_as_model().unwrap().unwrap();
//! assert_eq!(latest.round, 10);
//! ```

mod format;
mod manager;
mod reader;
mod writer;

pub use format::{CheckpointHeader, Compression, META_CREATED_AT, META_METRIC_PREFIX, META_ROUND};
pub use manager::{round_boundaries_from, CheckpointManager, CheckpointedModel};
pub use reader::CheckpointReader;
pub use writer::CheckpointWriter;
