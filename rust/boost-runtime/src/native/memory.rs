// rust/boost-runtime/src/native/memory.rs

//! Pure-Rust stand-in for the native library.
//!
//! Matrices hold labels and metadata only. Training never learns: the model
//! is a bincode record of the parameters and the cumulative round count, so
//! every worker of a round produces identical bytes. Metrics are computed
//! against a constant `base_score` prediction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Booster, CollectiveSession, ColumnarBatch, NativeBackend, NativeMatrix, TrainOutput,
    TrainRequest,
};
use crate::data::LabeledPoint;
use crate::error::{BoostError, Result};
use crate::tracker::{TrackerClient, ENV_TASK_ID, ENV_TRACKER_URI};

const DEFAULT_BASE_SCORE: f32 = 0.5;

/// In-process backend that tracks matrix lifetimes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    live: Arc<AtomicUsize>,
    built: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matrices created and not yet dropped.
    pub fn live_matrices(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Matrices created over the backend's lifetime.
    pub fn matrices_built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    fn new_matrix(&self, labels: Vec<f32>, cache: Option<PathBuf>) -> Box<dyn NativeMatrix> {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.built.fetch_add(1, Ordering::SeqCst);
        Box::new(MemoryMatrix {
            labels,
            base_margin: None,
            group_sizes: None,
            weights: None,
            cache,
            live: Arc::clone(&self.live),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MemoryModel {
    rounds: u32,
    objective: String,
    params: BTreeMap<String, String>,
}

struct MemoryMatrix {
    labels: Vec<f32>,
    base_margin: Option<Vec<f32>>,
    group_sizes: Option<Vec<u32>>,
    weights: Option<Vec<f32>>,
    cache: Option<PathBuf>,
    live: Arc<AtomicUsize>,
}

impl MemoryMatrix {
    fn rows(&self) -> usize {
        self.labels.len()
    }
}

impl NativeMatrix for MemoryMatrix {
    fn row_count(&self) -> Result<u64> {
        Ok(self.rows() as u64)
    }

    fn labels(&self) -> Result<Vec<f32>> {
        Ok(self.labels.clone())
    }

    fn set_base_margin(&mut self, margins: &[f32]) -> Result<()> {
        if margins.len() != self.rows() {
            return Err(BoostError::native(format!(
                "base margin has {} entries for {} rows",
                margins.len(),
                self.rows()
            )));
        }
        self.base_margin = Some(margins.to_vec());
        Ok(())
    }

    fn set_group(&mut self, group_sizes: &[u32]) -> Result<()> {
        let total: u64 = group_sizes.iter().map(|&s| u64::from(s)).sum();
        if total != self.rows() as u64 {
            return Err(BoostError::native(format!(
                "group sizes sum to {total} for {} rows",
                self.rows()
            )));
        }
        self.group_sizes = Some(group_sizes.to_vec());
        Ok(())
    }

    fn set_weight(&mut self, weights: &[f32]) -> Result<()> {
        let expected = self
            .group_sizes
            .as_ref()
            .map_or(self.rows(), Vec::len);
        if weights.len() != expected {
            return Err(BoostError::native(format!(
                "got {} weights, expected {expected}",
                weights.len()
            )));
        }
        self.weights = Some(weights.to_vec());
        Ok(())
    }
}

impl Drop for MemoryMatrix {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(cache) = &self.cache {
            debug!("Released cached matrix at {}", cache.display());
        }
    }
}

/// Session used when no tracker is configured: a collective of one.
struct SoloSession {
    rank: u32,
}

impl CollectiveSession for SoloSession {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn world_size(&self) -> u32 {
        1
    }

    fn shutdown(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn base_score(params: &BTreeMap<String, String>) -> Result<f32> {
    match params.get("base_score") {
        Some(v) => v
            .parse()
            .map_err(|_| BoostError::native(format!("invalid base_score '{v}'"))),
        None => Ok(DEFAULT_BASE_SCORE),
    }
}

fn rmse(predictions: &[f32], labels: &[f32]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let sum: f32 = predictions
        .iter()
        .zip(labels)
        .map(|(p, l)| (p - l) * (p - l))
        .sum();
    (sum / labels.len() as f32).sqrt()
}

impl NativeBackend for MemoryBackend {
    fn matrix_from_points(
        &self,
        points: &mut dyn Iterator<Item = LabeledPoint>,
        _missing: f32,
        cache: Option<&Path>,
    ) -> Result<Box<dyn NativeMatrix>> {
        let labels: Vec<f32> = points.map(|p| p.label).collect();

        if let Some(path) = cache {
            let bytes = bincode::serialize(&labels)
                .map_err(|e| BoostError::serialization(format!("failed to encode cache: {e}")))?;
            std::fs::write(path, bytes).map_err(|e| {
                BoostError::storage_with_source(path, "failed to write matrix cache", e)
            })?;
        }

        Ok(self.new_matrix(labels, cache.map(Path::to_path_buf)))
    }

    fn matrix_from_columnar(&self, batch: &ColumnarBatch, _missing: f32) -> Result<Box<dyn NativeMatrix>> {
        batch.validate()?;
        let mut matrix = self.new_matrix(batch.labels.clone(), None);
        if let Some(weights) = &batch.weights {
            matrix.set_weight(weights)?;
        }
        if let Some(margins) = &batch.base_margins {
            matrix.set_base_margin(margins)?;
        }
        Ok(matrix)
    }

    fn open_collective(&self, env: &BTreeMap<String, String>) -> Result<Box<dyn CollectiveSession>> {
        if env.contains_key(ENV_TRACKER_URI) {
            return Ok(Box::new(TrackerClient::connect(env)?));
        }
        let rank = env
            .get(ENV_TASK_ID)
            .and_then(|id| id.parse().ok())
            .unwrap_or(0);
        Ok(Box::new(SoloSession { rank }))
    }

    fn train(&self, request: TrainRequest<'_>) -> Result<TrainOutput> {
        let previous_rounds = match request.previous {
            Some(booster) => {
                bincode::deserialize::<MemoryModel>(booster.as_bytes())
                    .map_err(|e| BoostError::native(format!("unreadable previous model: {e}")))?
                    .rounds
            }
            None => 0,
        };

        let score = base_score(request.params)?;
        let train_labels = request.dtrain.labels()?;
        if let Some(objective) = request.objective {
            let predictions = vec![score; train_labels.len()];
            let gradients = objective.gradient(&predictions, &train_labels);
            if gradients.len() != train_labels.len() {
                return Err(BoostError::native(format!(
                    "objective '{}' returned {} gradients for {} rows",
                    objective.name(),
                    gradients.len(),
                    train_labels.len()
                )));
            }
        }

        let mut metrics = Vec::with_capacity(request.watches.len());
        for (_, matrix) in &request.watches {
            let labels = matrix.labels()?;
            let predictions = vec![score; labels.len()];
            let value = match request.eval {
                Some(eval) => eval.evaluate(&predictions, &labels),
                None => rmse(&predictions, &labels),
            };
            metrics.push(vec![value; request.rounds as usize]);
        }

        let objective = match request.objective {
            Some(custom) => custom.name().to_string(),
            None => request
                .params
                .get("objective")
                .cloned()
                .unwrap_or_default(),
        };
        let model = MemoryModel {
            rounds: previous_rounds + request.rounds,
            objective,
            params: request.params.clone(),
        };
        let bytes = bincode::serialize(&model)
            .map_err(|e| BoostError::serialization(format!("failed to encode model: {e}")))?;

        Ok(TrainOutput {
            booster: Booster::from_bytes(bytes),
            metrics,
        })
    }
}

/// Number of rounds recorded in a model produced by [`MemoryBackend`].
pub fn memory_model_rounds(booster: &Booster) -> Result<u32> {
    bincode::deserialize::<MemoryModel>(booster.as_bytes())
        .map(|m| m.rounds)
        .map_err(|e| BoostError::native(format!("not a memory backend model: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{EvalFunction, ObjectiveFunction};
    use tempfile::TempDir;

    fn matrix(backend: &MemoryBackend, labels: &[f32]) -> Box<dyn NativeMatrix> {
        let mut points = labels.iter().map(|&l| LabeledPoint::dense(l, vec![l]));
        backend.matrix_from_points(&mut points, f32::NAN, None).unwrap()
    }

    fn request<'a>(
        dtrain: &'a dyn NativeMatrix,
        params: &'a BTreeMap<String, String>,
        env: &'a BTreeMap<String, String>,
        rounds: u32,
        previous: Option<&'a Booster>,
    ) -> TrainRequest<'a> {
        TrainRequest {
            dtrain,
            params,
            rounds,
            watches: vec![("train", dtrain)],
            objective: None,
            eval: None,
            early_stopping_rounds: 0,
            previous,
            env,
        }
    }

    #[test]
    fn test_live_matrix_accounting() {
        let backend = MemoryBackend::new();
        let a = matrix(&backend, &[1.0, 2.0]);
        let b = matrix(&backend, &[3.0]);
        assert_eq!(backend.live_matrices(), 2);
        assert_eq!(a.row_count().unwrap(), 2);

        drop(a);
        assert_eq!(backend.live_matrices(), 1);
        drop(b);
        assert_eq!(backend.live_matrices(), 0);
        assert_eq!(backend.matrices_built(), 2);
    }

    #[test]
    fn test_cache_file_written() {
        let backend = MemoryBackend::new();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train");

        let mut points = vec![LabeledPoint::dense(1.0, vec![])].into_iter();
        let _m = backend
            .matrix_from_points(&mut points, f32::NAN, Some(&path))
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_metadata_lengths_checked() {
        let backend = MemoryBackend::new();
        let mut m = matrix(&backend, &[0.0, 1.0, 2.0]);

        assert!(m.set_base_margin(&[0.1]).is_err());
        assert!(m.set_base_margin(&[0.1, 0.2, 0.3]).is_ok());
        assert!(m.set_group(&[1, 1]).is_err());
        assert!(m.set_group(&[1, 2]).is_ok());
        // One weight per group once groups are set.
        assert!(m.set_weight(&[1.0, 1.0, 1.0]).is_err());
        assert!(m.set_weight(&[1.0, 2.0]).is_ok());
    }

    #[test]
    fn test_columnar_matrix() {
        let backend = MemoryBackend::new();
        let batch = ColumnarBatch {
            columns: vec![vec![1.0, 2.0]],
            labels: vec![0.0, 1.0],
            weights: Some(vec![1.0, 1.0]),
            base_margins: None,
        };
        let m = backend.matrix_from_columnar(&batch, f32::NAN).unwrap();
        assert_eq!(m.row_count().unwrap(), 2);

        let bad = ColumnarBatch {
            labels: vec![0.0],
            ..batch
        };
        assert!(backend.matrix_from_columnar(&bad, f32::NAN).is_err());
    }

    #[test]
    fn test_train_is_deterministic_and_chains_rounds() {
        let backend = MemoryBackend::new();
        let params = BTreeMap::from([("eta".to_string(), "0.1".to_string())]);
        let env = BTreeMap::new();

        let m1 = matrix(&backend, &[0.0, 1.0]);
        let m2 = matrix(&backend, &[1.0, 1.0, 0.0]);
        let a = backend.train(request(m1.as_ref(), &params, &env, 3, None)).unwrap();
        let b = backend.train(request(m2.as_ref(), &params, &env, 3, None)).unwrap();
        assert_eq!(a.booster, b.booster);
        assert_eq!(a.metrics.len(), 1);
        assert_eq!(a.metrics[0].len(), 3);

        let c = backend
            .train(request(m1.as_ref(), &params, &env, 2, Some(&a.booster)))
            .unwrap();
        assert_eq!(memory_model_rounds(&c.booster).unwrap(), 5);
    }

    #[test]
    fn test_rejects_foreign_previous_model() {
        let backend = MemoryBackend::new();
        let params = BTreeMap::new();
        let env = BTreeMap::new();
        let m = matrix(&backend, &[0.0]);
        let foreign = Booster::from_bytes(vec![0xFF]);

        assert!(backend
            .train(request(m.as_ref(), &params, &env, 1, Some(&foreign)))
            .is_err());
    }

    struct ConstantMetric;

    impl EvalFunction for ConstantMetric {
        fn name(&self) -> &str {
            "constant"
        }

        fn evaluate(&self, _predictions: &[f32], _labels: &[f32]) -> f32 {
            0.25
        }
    }

    struct BrokenObjective;

    impl ObjectiveFunction for BrokenObjective {
        fn name(&self) -> &str {
            "broken"
        }

        fn gradient(&self, _predictions: &[f32], _labels: &[f32]) -> Vec<(f32, f32)> {
            Vec::new()
        }
    }

    #[test]
    fn test_custom_eval_and_objective() {
        let backend = MemoryBackend::new();
        let params = BTreeMap::new();
        let env = BTreeMap::new();
        let m = matrix(&backend, &[0.0, 1.0]);

        let mut req = request(m.as_ref(), &params, &env, 2, None);
        req.eval = Some(&ConstantMetric);
        let out = backend.train(req).unwrap();
        assert_eq!(out.metrics[0], vec![0.25, 0.25]);

        let mut req = request(m.as_ref(), &params, &env, 2, None);
        req.objective = Some(&BrokenObjective);
        assert!(backend.train(req).is_err());
    }

    #[test]
    fn test_solo_session_without_tracker() {
        let backend = MemoryBackend::new();
        let env = BTreeMap::from([(ENV_TASK_ID.to_string(), "4".to_string())]);
        let session = backend.open_collective(&env).unwrap();
        assert_eq!(session.rank(), 4);
        assert_eq!(session.world_size(), 1);
        session.shutdown().unwrap();
    }
}
