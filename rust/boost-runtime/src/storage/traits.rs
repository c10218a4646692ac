// rust/boost-runtime/src/storage/traits.rs

//! Blocking storage traits used by the checkpoint manager.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

/// A handle for reading one stored object.
pub trait StorageReader: Read + Send {
    /// Total size of the object in bytes.
    fn size(&self) -> u64;
}

/// A handle for writing one stored object.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the object. The writer must not be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or the sync fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Operations a storage backend must support to hold model checkpoints.
///
/// Object-safe; the runtime holds backends as `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating it and creating parents.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Deletes an object. Directories are removed recursively.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists entry names directly under `prefix`, sorted. A missing prefix
    /// lists as empty.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;
}
