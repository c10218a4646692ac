// rust/boost-runtime/src/engine/mod.rs

//! Cluster execution boundary.
//!
//! The orchestrator hands an engine one task per data partition and blocks
//! until all of them have finished. [`LocalCluster`] runs the tasks on OS
//! threads in this process.

mod local;
mod partitioned;

pub use local::LocalCluster;
pub use partitioned::Partitioned;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::native::Booster;

/// Shared, advisory cancellation signal for one distributed job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one worker task needs to know about its round.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub partition: usize,
    /// Rendezvous environment for this task, including `DMLC_TASK_ID`.
    pub env: BTreeMap<String, String>,
    /// Rounds to train in this segment.
    pub rounds: u32,
    /// Raised when the round has already failed elsewhere.
    pub cancel: CancelFlag,
}

/// Result of one worker task: the trained model and per-dataset metrics.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub partition: usize,
    pub booster: Booster,
    pub metrics: BTreeMap<String, Vec<f32>>,
}

pub type PartitionTask = Box<dyn FnOnce() -> Result<WorkerOutput> + Send>;

/// Runs one task per partition.
pub trait ClusterEngine: Send + Sync {
    /// Runs every task and returns their outputs ordered by partition.
    ///
    /// Cancellation is advisory: an engine checks `cancel` before starting a
    /// task, and a task checks it again before joining the collective. Native
    /// training already under way is never interrupted.
    ///
    /// # Errors
    ///
    /// Returns the error of the lowest failing partition.
    fn run_job(&self, tasks: Vec<PartitionTask>, cancel: &CancelFlag) -> Result<Vec<WorkerOutput>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());

        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
