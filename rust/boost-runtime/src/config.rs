// rust/boost-runtime/src/config.rs

//! Configuration management for distributed boosting runs.
//!
//! Configuration is parsed from TOML, optionally overridden from `DBR_`
//! prefixed environment variables, and validated before any worker is
//! launched. Every validation failure is a configuration error.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BoostError, Result};

/// Name under which the training set appears in watches and metrics.
pub const TRAIN_NAME: &str = "train";

/// Name of the holdout matrix produced by a train/test split.
pub const TEST_NAME: &str = "test";

// Top-level training configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub training: TrainingParams,
    pub tracker: TrackerConfig,
    pub checkpoint: CheckpointConfig,
    pub storage: StorageConfig,
}

/// Parameters of the boosting job itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of worker partitions (one task per partition).
    pub num_workers: usize,
    /// Total number of boosting rounds.
    pub num_rounds: u32,
    /// Objective name; objectives starting with `rank:` enable group handling.
    pub objective: String,
    /// Missing-value sentinel. NaN strips NaN entries.
    pub missing: f32,
    /// Fraction of points kept for training when no eval sets are given.
    pub train_test_ratio: f64,
    /// Seed for the train/test split.
    pub seed: u64,
    /// Back training matrices with an on-disk cache.
    pub use_external_memory: bool,
    /// Parent directory for external-memory caches (system temp dir if unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    // 0 disables early stopping.
    pub early_stopping_rounds: u32,
    // Compare booster fingerprints of every worker after each round.
    pub verify_worker_consistency: bool,
    /// Opaque parameters forwarded to the native library.
    pub params: BTreeMap<String, String>,
}

// Rendezvous tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Address the tracker binds to.
    pub host: String,
    /// Port the tracker binds to (0 picks an ephemeral port).
    pub port: u16,
    /// How long to wait for the tracker to become ready (0 = unbounded).
    pub start_timeout_ms: u64,
    /// How long to wait for all workers to finish (0 = unbounded).
    pub wait_timeout_ms: u64,
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for model checkpoints. Checkpointing is off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    /// Rounds between checkpoints (0 = only the final round).
    pub interval: u32,
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (algorithm-specific).
    pub compression_level: i32,
    // Number of recent checkpoints to keep.
    pub keep_last_n: usize,
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
    /// Keep the checkpoint directory after a successful run.
    pub skip_clean_checkpoint: bool,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path for relative storage paths.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_rounds: 10,
            objective: "reg:squarederror".to_string(),
            missing: f32::NAN,
            train_test_ratio: 1.0,
            seed: 0,
            use_external_memory: false,
            cache_dir: None,
            early_stopping_rounds: 0,
            verify_worker_consistency: true,
            params: BTreeMap::new(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            start_timeout_ms: 0,
            wait_timeout_ms: 0,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            interval: 0,
            compression: "none".to_string(),
            compression_level: 1,
            keep_last_n: 1,
            atomic_writes: true,
            skip_clean_checkpoint: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
        }
    }
}

impl TrainingParams {
    /// Whether the objective is a ranking objective.
    pub fn is_ranking(&self) -> bool {
        self.objective.starts_with("rank:")
    }
}

impl TrackerConfig {
    pub fn start_timeout(&self) -> Option<Duration> {
        millis_or_unbounded(self.start_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        millis_or_unbounded(self.wait_timeout_ms)
    }
}

fn millis_or_unbounded(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

impl FromStr for TrainingConfig {
    type Err = BoostError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| BoostError::config_with_source("failed to parse TOML config", e))
    }
}

impl TrainingConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoostError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `DBR_` and name the section and field, e.g.
    // `DBR_TRAINING_NUM_WORKERS` or `DBR_CHECKPOINT_DIR`. Unparseable values
    // are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Training overrides
        if let Ok(val) = std::env::var("DBR_TRAINING_NUM_WORKERS") {
            if let Ok(v) = val.parse() {
                self.training.num_workers = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_NUM_ROUNDS") {
            if let Ok(v) = val.parse() {
                self.training.num_rounds = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_OBJECTIVE") {
            self.training.objective = val;
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_MISSING") {
            if let Ok(v) = val.parse() {
                self.training.missing = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_TRAIN_TEST_RATIO") {
            if let Ok(v) = val.parse() {
                self.training.train_test_ratio = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_SEED") {
            if let Ok(v) = val.parse() {
                self.training.seed = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_USE_EXTERNAL_MEMORY") {
            if let Ok(v) = val.parse() {
                self.training.use_external_memory = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRAINING_CACHE_DIR") {
            self.training.cache_dir = Some(PathBuf::from(val));
        }

        // Tracker overrides
        if let Ok(val) = std::env::var("DBR_TRACKER_HOST") {
            self.tracker.host = val;
        }
        if let Ok(val) = std::env::var("DBR_TRACKER_PORT") {
            if let Ok(v) = val.parse() {
                self.tracker.port = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRACKER_START_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.tracker.start_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_TRACKER_WAIT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.tracker.wait_timeout_ms = v;
            }
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("DBR_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("DBR_CHECKPOINT_INTERVAL") {
            if let Ok(v) = val.parse() {
                self.checkpoint.interval = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Ok(val) = std::env::var("DBR_CHECKPOINT_KEEP_LAST_N") {
            if let Ok(v) = val.parse() {
                self.checkpoint.keep_last_n = v;
            }
        }
        if let Ok(val) = std::env::var("DBR_CHECKPOINT_SKIP_CLEAN") {
            if let Ok(v) = val.parse() {
                self.checkpoint.skip_clean_checkpoint = v;
            }
        }

        // Storage overrides
        if let Ok(val) = std::env::var("DBR_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Training validation
        if self.training.num_workers == 0 {
            return Err(BoostError::config(
                "training.num_workers must be greater than 0",
            ));
        }
        if self.training.num_rounds == 0 {
            return Err(BoostError::config(
                "training.num_rounds must be at least 1",
            ));
        }
        let ratio = self.training.train_test_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(BoostError::config(format!(
                "training.train_test_ratio must be in (0, 1], got {ratio}"
            )));
        }

        // Tracker validation
        if self.tracker.host.is_empty() {
            return Err(BoostError::config("tracker.host must not be empty"));
        }

        // Checkpoint validation
        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(BoostError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }
        if self.checkpoint.keep_last_n == 0 {
            return Err(BoostError::config(
                "checkpoint.keep_last_n must be greater than 0",
            ));
        }
        if self.checkpoint.interval > 0 && self.checkpoint.checkpoint_dir.is_none() {
            return Err(BoostError::config(
                "checkpoint.interval is set but checkpoint.checkpoint_dir is missing",
            ));
        }

        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(BoostError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Validate the names of user-supplied evaluation sets.
///
/// `"train"` is reserved for the training set, and names must be unique.
pub fn validate_eval_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(BoostError::config("eval set names must not be empty"));
        }
        if name == TRAIN_NAME {
            return Err(BoostError::config(format!(
                "eval set name '{TRAIN_NAME}' is reserved for the training set"
            )));
        }
        if name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(BoostError::config(format!(
                "eval set name '{name}' must not contain path components"
            )));
        }
        if !seen.insert(name) {
            return Err(BoostError::config(format!("duplicate eval set name '{name}'")));
        }
    }
    Ok(())
}
