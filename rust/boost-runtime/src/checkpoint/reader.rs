// rust/boost-runtime/src/checkpoint/reader.rs

//! Checkpoint reader.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::{BoostError, Result};
use crate::storage::StorageBackend;

use super::format::{self, CheckpointHeader};

/// Reads checkpoint files and verifies their integrity.
pub struct CheckpointReader {
    storage: Arc<dyn StorageBackend>,
}

impl CheckpointReader {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Reads, decompresses and verifies one checkpoint.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, the framing or magic is invalid,
    /// decompression fails, or the size or checksum does not match the header.
    pub fn read(&self, path: &Path) -> Result<(CheckpointHeader, Vec<u8>)> {
        let mut reader = self.storage.open_read(path)?;
        let mut raw = Vec::with_capacity(reader.size() as usize);
        reader
            .read_to_end(&mut raw)
            .map_err(|e| BoostError::storage_with_source(path, "failed to read checkpoint file", e))?;

        let (header, compressed) = format::decode(&raw)?;
        let data = header.compression.decompress(compressed)?;

        if data.len() as u64 != header.uncompressed_size {
            return Err(BoostError::checkpoint(format!(
                "size mismatch in {}: expected {}, got {}",
                path.display(),
                header.uncompressed_size,
                data.len()
            )));
        }

        let computed = format::checksum(&data);
        if computed != header.checksum {
            return Err(BoostError::checkpoint(format!(
                "checksum mismatch in {}: expected {}, got {}",
                path.display(),
                header.checksum,
                computed
            )));
        }

        Ok((header, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointWriter;
    use crate::config::{CheckpointConfig, StorageConfig};
    use crate::storage::LocalStorage;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_setup(compression: &str) -> (CheckpointWriter, CheckpointReader, Arc<dyn StorageBackend>, TempDir) {
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
            compression_level: 3,
            ..Default::default()
        };
        let writer = CheckpointWriter::new(storage.clone(), &config).unwrap();
        let reader = CheckpointReader::new(storage.clone());
        (writer, reader, storage, temp_dir)
    }

    #[test]
    fn test_roundtrip_every_compression() {
        for compression in ["none", "lz4", "zstd"] {
            let (writer, reader, _, _temp) = create_test_setup(compression);
            let path = Path::new("ckpt/7.model");
            let mut metadata = BTreeMap::new();
            metadata.insert("round".to_string(), "7".to_string());

            let data = b"serialized booster with repeated content content content";
            writer.write(path, data, metadata).unwrap();

            let (header, read) = reader.read(path).unwrap();
            assert_eq!(read, data);
            assert_eq!(header.round(), Some(7));
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let (writer, reader, storage, _temp) = create_test_setup("none");
        let path = Path::new("corrupt.model");
        writer.write(path, b"original data", BTreeMap::new()).unwrap();

        let mut raw = Vec::new();
        storage.open_read(path).unwrap().read_to_end(&mut raw).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;

        let mut w = storage.open_write(path).unwrap();
        w.write_all(&raw).unwrap();
        w.finish().unwrap();

        let err = reader.read(path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_garbage_file() {
        let (_, reader, storage, _temp) = create_test_setup("none");
        let path = Path::new("garbage.model");
        let mut w = storage.open_write(path).unwrap();
        w.write_all(b"xy").unwrap();
        w.finish().unwrap();

        assert!(reader.read(path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let (_, reader, _, _temp) = create_test_setup("none");
        assert!(reader.read(Path::new("nope.model")).is_err());
    }
}
