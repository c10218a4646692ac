// rust/boost-runtime/src/native/mod.rs

//! Boundary to the native boosting library.
//!
//! The runtime never trains trees itself. It builds matrices through a
//! [`NativeBackend`], joins the collective for the round, and calls
//! [`NativeBackend::train`]. Every handle the backend returns is released
//! when dropped.

mod memory;

pub use memory::{memory_model_rounds, MemoryBackend};

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::path::Path;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::data::{LabeledPoint, LabeledPointGroup};
use crate::error::{BoostError, Result};

/// Serialized model bytes produced by the native library.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booster {
    bytes: Vec<u8>,
}

impl Booster {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// XXHash64 of the model bytes, used to compare workers' results.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&self.bytes);
        hasher.finish()
    }
}

impl std::fmt::Debug for Booster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Booster")
            .field("len", &self.bytes.len())
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint()))
            .finish()
    }
}

/// Column-major feature block handed over by a columnar reader.
#[derive(Debug, Clone, Default)]
pub struct ColumnarBatch {
    pub columns: Vec<Vec<f32>>,
    pub labels: Vec<f32>,
    pub weights: Option<Vec<f32>>,
    pub base_margins: Option<Vec<f32>>,
}

impl ColumnarBatch {
    pub fn num_rows(&self) -> usize {
        self.labels.len()
    }

    /// Checks that every column and optional vector has one entry per row.
    pub fn validate(&self) -> Result<()> {
        let rows = self.num_rows();
        if let Some(i) = self.columns.iter().position(|c| c.len() != rows) {
            return Err(BoostError::native(format!(
                "column {i} has {} values, expected {rows}",
                self.columns[i].len()
            )));
        }
        for (name, extra) in [("weights", &self.weights), ("base margins", &self.base_margins)] {
            if let Some(v) = extra {
                if v.len() != rows {
                    return Err(BoostError::native(format!(
                        "{name} have {} values, expected {rows}",
                        v.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where the rows of one watch matrix come from.
#[derive(Debug, Clone)]
pub enum MatrixSource {
    Rows(Vec<LabeledPoint>),
    Groups(Vec<LabeledPointGroup>),
    Columnar(ColumnarBatch),
}

/// A native training matrix. Dropping it releases the native handle.
pub trait NativeMatrix: Send {
    fn row_count(&self) -> Result<u64>;

    fn labels(&self) -> Result<Vec<f32>>;

    fn set_base_margin(&mut self, margins: &[f32]) -> Result<()>;

    /// Sets group boundaries as consecutive group sizes.
    fn set_group(&mut self, group_sizes: &[u32]) -> Result<()>;

    /// Sets instance weights; for grouped matrices, one weight per group.
    fn set_weight(&mut self, weights: &[f32]) -> Result<()>;
}

/// Membership in the round's allreduce collective.
///
/// [`CollectiveSession::shutdown`] signals a clean exit; dropping a session
/// without calling it tells the rest of the collective this worker failed.
pub trait CollectiveSession: Send {
    fn rank(&self) -> u32;

    fn world_size(&self) -> u32;

    fn shutdown(self: Box<Self>) -> Result<()>;
}

/// A custom objective: gradient and hessian per prediction.
pub trait ObjectiveFunction: Send + Sync {
    fn name(&self) -> &str;

    fn gradient(&self, predictions: &[f32], labels: &[f32]) -> Vec<(f32, f32)>;
}

/// A custom evaluation metric.
pub trait EvalFunction: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, predictions: &[f32], labels: &[f32]) -> f32;
}

/// Arguments of one native training call.
pub struct TrainRequest<'a> {
    pub dtrain: &'a dyn NativeMatrix,
    pub params: &'a BTreeMap<String, String>,
    pub rounds: u32,
    /// Named matrices to evaluate after every round, `"train"` included.
    pub watches: Vec<(&'a str, &'a dyn NativeMatrix)>,
    pub objective: Option<&'a dyn ObjectiveFunction>,
    pub eval: Option<&'a dyn EvalFunction>,
    pub early_stopping_rounds: u32,
    pub previous: Option<&'a Booster>,
    pub env: &'a BTreeMap<String, String>,
}

/// Result of one native training call.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub booster: Booster,
    /// One metric series per watch, in watch order, one value per round.
    pub metrics: Vec<Vec<f32>>,
}

/// The native library's entry points.
pub trait NativeBackend: Send + Sync {
    /// Builds a matrix from points. With `cache` set the matrix is backed by
    /// an on-disk cache at that path.
    fn matrix_from_points(
        &self,
        points: &mut dyn Iterator<Item = LabeledPoint>,
        missing: f32,
        cache: Option<&Path>,
    ) -> Result<Box<dyn NativeMatrix>>;

    fn matrix_from_columnar(&self, batch: &ColumnarBatch, missing: f32) -> Result<Box<dyn NativeMatrix>>;

    /// Joins the collective described by `env`.
    fn open_collective(&self, env: &BTreeMap<String, String>) -> Result<Box<dyn CollectiveSession>>;

    fn train(&self, request: TrainRequest<'_>) -> Result<TrainOutput>;
}
