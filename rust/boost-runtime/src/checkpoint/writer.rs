// rust/boost-runtime/src/checkpoint/writer.rs

//! Checkpoint writer.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::CheckpointConfig;
use crate::error::{BoostError, Result};
use crate::storage::StorageBackend;

use super::format::{self, CheckpointHeader, Compression};

/// Writes compressed, checksummed checkpoint files.
///
/// With `atomic_writes` the file is first written to `.<name>.tmp` next to
/// its destination and then renamed, so readers never observe a partial file.
pub struct CheckpointWriter {
    storage: Arc<dyn StorageBackend>,
    compression: Compression,
    compression_level: i32,
    atomic_writes: bool,
}

impl CheckpointWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &CheckpointConfig) -> Result<Self> {
        Ok(Self {
            storage,
            compression: config.compression.parse()?,
            compression_level: config.compression_level,
            atomic_writes: config.atomic_writes,
        })
    }

    /// Writes `data` to `path` with the given header metadata.
    pub fn write(
        &self,
        path: &Path,
        data: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let header = CheckpointHeader::for_payload(data, self.compression, metadata);
        let compressed = self.compression.compress(data, self.compression_level)?;
        let framed = format::encode(&header, &compressed)?;

        if self.atomic_writes {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| BoostError::storage(path, "checkpoint path has no file name"))?;
            let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

            self.write_to_path(&temp_path, &framed)?;
            self.storage.rename(&temp_path, path)
        } else {
            self.write_to_path(path, &framed)
        }
    }

    fn write_to_path(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut writer = self.storage.open_write(path)?;
        writer.write_all(data).map_err(|e| {
            BoostError::storage_with_source(path, "failed to write checkpoint data", e)
        })?;
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    fn create_test_writer(compression: &str, atomic_writes: bool) -> (CheckpointWriter, Arc<dyn StorageBackend>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(
            LocalStorage::new(&StorageConfig {
                base_path: temp_dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        );
        let config = CheckpointConfig {
            compression: compression.to_string(),
            atomic_writes,
            ..Default::default()
        };
        let writer = CheckpointWriter::new(storage.clone(), &config).unwrap();
        (writer, storage, temp_dir)
    }

    #[test]
    fn test_rejects_unknown_compression() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(
            LocalStorage::new(&StorageConfig {
                base_path: temp_dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        );
        let config = CheckpointConfig {
            compression: "brotli".to_string(),
            ..Default::default()
        };
        assert!(CheckpointWriter::new(storage, &config).is_err());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let (writer, storage, _temp) = create_test_writer("none", true);
        let path = Path::new("ckpt/4.model");

        writer.write(path, b"atomic", BTreeMap::new()).unwrap();

        assert!(storage.exists(path).unwrap());
        assert!(!storage.exists(Path::new("ckpt/.4.model.tmp")).unwrap());
    }

    #[test]
    fn test_direct_write() {
        let (writer, storage, _temp) = create_test_writer("lz4", false);
        let path = Path::new("ckpt/2.model");

        writer.write(path, b"direct", BTreeMap::new()).unwrap();
        assert_eq!(storage.list(Path::new("ckpt")).unwrap(), vec!["2.model"]);
    }

    #[test]
    fn test_compressed_file_is_smaller() {
        let (writer, storage, _temp) = create_test_writer("zstd", true);
        let data = vec![b'a'; 10_000];
        let path = Path::new("big.model");

        writer.write(path, &data, BTreeMap::new()).unwrap();

        let reader = storage.open_read(path).unwrap();
        assert!(reader.size() < data.len() as u64);
    }
}
