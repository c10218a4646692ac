// rust/boost-runtime/src/storage/mod.rs

//! Storage abstraction for checkpoint persistence.
//!
//! The checkpoint manager only talks to [`StorageBackend`], so checkpoints
//! can live anywhere a backend is written for. [`LocalStorage`] keeps them
//! on the local filesystem, resolving relative paths against a base path.
//!
//! ```no_run
//! use boost_runtime::config::StorageConfig;
//! use boost_runtime::storage::{LocalStorage, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default()).unwrap();
//! let mut writer = storage.open_write(Path::new("notes.txt")).unwrap();
//! writer.write_all(b"round 3").unwrap();
//! writer.finish().unwrap();
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader, StorageWriter};
