// rust/boost-runtime/src/checkpoint/manager.rs

//! Versioned model checkpoints in one directory.
//!
//! Every checkpoint is a file named `<round>.model`, where `<round>` is the
//! number of boosting rounds the model has completed. The highest version is
//! the resume point.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::{CheckpointConfig, TrainingConfig};
use crate::error::{BoostError, Result};
use crate::native::Booster;
use crate::storage::{LocalStorage, StorageBackend};

use super::format::{CheckpointHeader, META_CREATED_AT, META_ROUND};
use super::reader::CheckpointReader;
use super::writer::CheckpointWriter;

const MODEL_SUFFIX: &str = ".model";

/// A persisted model, the number of rounds it has completed and the
/// per-round metrics recorded up to that point.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointedModel {
    pub booster: Booster,
    pub round: u32,
    pub metrics: BTreeMap<String, Vec<f32>>,
}

/// Writes, loads and prunes model checkpoints.
pub struct CheckpointManager {
    storage: Arc<dyn StorageBackend>,
    dir: PathBuf,
    writer: CheckpointWriter,
    reader: CheckpointReader,
    keep_last_n: usize,
}

impl CheckpointManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        dir: impl Into<PathBuf>,
        config: &CheckpointConfig,
    ) -> Result<Self> {
        Ok(Self {
            writer: CheckpointWriter::new(Arc::clone(&storage), config)?,
            reader: CheckpointReader::new(Arc::clone(&storage)),
            storage,
            dir: dir.into(),
            keep_last_n: config.keep_last_n.max(1),
        })
    }

    /// Builds a manager on local storage, or `None` when checkpointing is
    /// not configured.
    pub fn from_config(config: &TrainingConfig) -> Result<Option<Self>> {
        let Some(dir) = &config.checkpoint.checkpoint_dir else {
            return Ok(None);
        };
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        Self::new(storage, dir.clone(), &config.checkpoint).map(Some)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, round: u32) -> PathBuf {
        self.dir.join(format!("{round}{MODEL_SUFFIX}"))
    }

    /// Checkpointed versions in ascending order. Files that are not
    /// `<round>.model` are ignored.
    pub fn versions(&self) -> Result<Vec<u32>> {
        let mut versions: Vec<u32> = self
            .storage
            .list(&self.dir)?
            .iter()
            .filter_map(|name| name.strip_suffix(MODEL_SUFFIX))
            .filter_map(|stem| stem.parse().ok())
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_version(&self) -> Result<Option<u32>> {
        Ok(self.versions()?.last().copied())
    }

    /// Deletes every checkpoint with more than `max_round` completed rounds.
    ///
    /// Called before resuming so that a directory left behind by a longer
    /// run cannot seed a shorter one.
    pub fn clean_up_higher_versions(&self, max_round: u32) -> Result<()> {
        for version in self.versions()? {
            if version > max_round {
                info!(
                    "Deleting checkpoint {} (beyond round {})",
                    version, max_round
                );
                self.storage.delete(&self.path_for(version))?;
            }
        }
        Ok(())
    }

    /// Loads the highest checkpoint, verifying its integrity.
    pub fn load_latest_as_model(&self) -> Result<Option<CheckpointedModel>> {
        let Some(version) = self.latest_version()? else {
            return Ok(None);
        };

        let path = self.path_for(version);
        let (header, payload) = self.reader.read(&path)?;
        if let Some(recorded) = header.round() {
            if recorded != version {
                return Err(BoostError::checkpoint(format!(
                    "{} records round {recorded}",
                    path.display()
                )));
            }
        }

        let metrics = header.metrics()?;
        info!("Loaded checkpoint at round {} from {}", version, path.display());
        Ok(Some(CheckpointedModel {
            booster: Booster::from_bytes(payload),
            round: version,
            metrics,
        }))
    }

    /// Rounds at which training pauses to checkpoint, ending with `total`.
    ///
    /// Resumes from the latest checkpoint (or round 0).
    pub fn round_boundaries(&self, interval: u32, total: u32) -> Result<Vec<u32>> {
        let start = self.latest_version()?.unwrap_or(0);
        Ok(round_boundaries_from(start, interval, total))
    }

    /// Persists `booster` as the checkpoint for `round` completed rounds and
    /// prunes all but the newest `keep_last_n` checkpoints.
    pub fn update_checkpoint(&self, booster: &Booster, round: u32) -> Result<()> {
        self.update_checkpoint_with_metrics(booster, round, &BTreeMap::new())
    }

    /// Like [`CheckpointManager::update_checkpoint`], also recording the
    /// metric history of rounds `0..round` so a resumed run can report it.
    pub fn update_checkpoint_with_metrics(
        &self,
        booster: &Booster,
        round: u32,
        metrics: &BTreeMap<String, Vec<f32>>,
    ) -> Result<()> {
        self.storage.create_dir_all(&self.dir)?;

        let mut metadata = BTreeMap::new();
        metadata.insert(META_ROUND.to_string(), round.to_string());
        metadata.insert(META_CREATED_AT.to_string(), Utc::now().to_rfc3339());
        CheckpointHeader::insert_metrics(&mut metadata, metrics);

        let path = self.path_for(round);
        self.writer.write(&path, booster.as_bytes(), metadata)?;
        info!(
            "Saved checkpoint at round {} to {} ({} bytes)",
            round,
            path.display(),
            booster.as_bytes().len()
        );

        let versions = self.versions()?;
        if versions.len() > self.keep_last_n {
            let stale = versions.len() - self.keep_last_n;
            for &version in &versions[..stale] {
                debug!("Removing old checkpoint {}", version);
                self.storage.delete(&self.path_for(version))?;
            }
        }
        Ok(())
    }

    /// Removes the checkpoint directory and everything in it.
    pub fn clean_path(&self) -> Result<()> {
        if self.storage.exists(&self.dir)? {
            self.storage.delete(&self.dir)?;
            info!("Removed checkpoint directory {}", self.dir.display());
        }
        Ok(())
    }
}

/// `start + interval, start + 2 * interval, ...` below `total`, then `total`.
/// An interval of 0 checkpoints only at the end.
pub fn round_boundaries_from(start: u32, interval: u32, total: u32) -> Vec<u32> {
    let mut boundaries = Vec::new();
    if interval > 0 {
        let mut round = start.saturating_add(interval);
        while round < total {
            boundaries.push(round);
            round = round.saturating_add(interval);
        }
    }
    boundaries.push(total);
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_manager(compression: &str, keep_last_n: usize) -> (CheckpointManager, TempDir) {
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
            keep_last_n,
            ..Default::default()
        };
        let manager = CheckpointManager::new(storage, "ckpt", &config).unwrap();
        (manager, temp_dir)
    }

    fn booster(tag: u8) -> Booster {
        Booster::from_bytes(vec![tag; 64])
    }

    #[test]
    fn test_empty_directory() {
        let (manager, _temp) = create_test_manager("none", 1);
        assert!(manager.versions().unwrap().is_empty());
        assert!(manager.load_latest_as_model().unwrap().is_none());
        assert_eq!(manager.round_boundaries(3, 10).unwrap(), vec![3, 6, 9, 10]);
    }

    #[test]
    fn test_round_trip() {
        for compression in ["none", "lz4", "zstd"] {
            let (manager, _temp) = create_test_manager(compression, 1);
            manager.update_checkpoint(&booster(7), 4).unwrap();

            let loaded = manager.load_latest_as_model().unwrap().unwrap();
            assert_eq!(
                loaded,
                CheckpointedModel {
                    booster: booster(7),
                    round: 4,
                    metrics: BTreeMap::new(),
                }
            );
        }
    }

    #[test]
    fn test_metrics_survive_checkpoint() {
        let (manager, _temp) = create_test_manager("zstd", 1);
        let mut history = BTreeMap::new();
        history.insert("train".to_string(), vec![0.9, 0.7, 0.6]);
        history.insert("valid".to_string(), vec![1.0, 0.8, 0.75]);
        manager
            .update_checkpoint_with_metrics(&booster(3), 3, &history)
            .unwrap();

        let loaded = manager.load_latest_as_model().unwrap().unwrap();
        assert_eq!(loaded.round, 3);
        assert_eq!(loaded.metrics, history);
    }

    #[test]
    fn test_corrupted_checkpoint_fails() {
        let (manager, temp) = create_test_manager("none", 1);
        manager.update_checkpoint(&booster(1), 2).unwrap();

        let path = temp.path().join("ckpt").join("2.model");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = manager.load_latest_as_model().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
    }

    #[test]
    fn test_keeps_last_n() {
        let (manager, _temp) = create_test_manager("none", 2);
        for round in [2, 4, 6, 8] {
            manager.update_checkpoint(&booster(round as u8), round).unwrap();
        }
        assert_eq!(manager.versions().unwrap(), vec![6, 8]);
        assert_eq!(manager.load_latest_as_model().unwrap().unwrap().round, 8);
    }

    #[test]
    fn test_default_keeps_only_latest() {
        let (manager, _temp) = create_test_manager("lz4", 1);
        manager.update_checkpoint(&booster(1), 5).unwrap();
        manager.update_checkpoint(&booster(2), 10).unwrap();
        assert_eq!(manager.versions().unwrap(), vec![10]);
    }

    #[test]
    fn test_versions_sort_numerically_and_skip_foreign_files() {
        let (manager, temp) = create_test_manager("none", 10);
        for round in [9, 10, 100] {
            manager.update_checkpoint(&booster(0), round).unwrap();
        }
        let dir = temp.path().join("ckpt");
        std::fs::File::create(dir.join("notes.txt"))
            .unwrap()
            .write_all(b"x")
            .unwrap();
        std::fs::write(dir.join(".11.model.tmp"), b"partial").unwrap();

        assert_eq!(manager.versions().unwrap(), vec![9, 10, 100]);
        assert_eq!(manager.latest_version().unwrap(), Some(100));
    }

    #[test]
    fn test_clean_up_higher_versions() {
        let (manager, _temp) = create_test_manager("none", 10);
        for round in [3, 6, 9, 12] {
            manager.update_checkpoint(&booster(round as u8), round).unwrap();
        }

        manager.clean_up_higher_versions(8).unwrap();
        assert_eq!(manager.versions().unwrap(), vec![3, 6]);

        let loaded = manager.load_latest_as_model().unwrap().unwrap();
        assert_eq!(loaded.round, 6);
        assert_eq!(loaded.booster, booster(6));
    }

    #[test]
    fn test_round_boundaries_resume() {
        let (manager, _temp) = create_test_manager("none", 1);
        manager.update_checkpoint(&booster(0), 4).unwrap();

        assert_eq!(manager.round_boundaries(4, 18).unwrap(), vec![8, 12, 16, 18]);
        assert_eq!(manager.round_boundaries(0, 18).unwrap(), vec![18]);
    }

    #[test]
    fn test_round_boundaries_from() {
        assert_eq!(round_boundaries_from(0, 0, 5), vec![5]);
        assert_eq!(round_boundaries_from(0, 5, 5), vec![5]);
        assert_eq!(round_boundaries_from(0, 2, 5), vec![2, 4, 5]);
        assert_eq!(round_boundaries_from(3, 2, 8), vec![5, 7, 8]);
        assert_eq!(round_boundaries_from(0, 7, 3), vec![3]);
    }

    #[test]
    fn test_clean_path() {
        let (manager, temp) = create_test_manager("none", 1);
        manager.update_checkpoint(&booster(0), 1).unwrap();
        assert!(temp.path().join("ckpt").exists());

        manager.clean_path().unwrap();
        assert!(!temp.path().join("ckpt").exists());

        // Cleaning an absent directory is fine.
        manager.clean_path().unwrap();
    }

    #[test]
    fn test_from_config_disabled_without_dir() {
        assert!(CheckpointManager::from_config(&TrainingConfig::default())
            .unwrap()
            .is_none());
    }
}
