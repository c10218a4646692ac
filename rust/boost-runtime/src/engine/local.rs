// rust/boost-runtime/src/engine/local.rs

use std::thread;

use tracing::{debug, warn};

use super::{CancelFlag, ClusterEngine, PartitionTask, WorkerOutput};
use crate::error::{BoostError, Result};

/// In-process engine running each task on its own named thread.
///
/// All threads start at once, so the start-of-task cancellation check only
/// matters for a flag raised before the job; later cancellation is seen by
/// the task itself through its `WorkerContext`.
#[derive(Debug, Clone, Default)]
pub struct LocalCluster;

impl LocalCluster {
    pub fn new() -> Self {
        Self
    }
}

impl ClusterEngine for LocalCluster {
    fn run_job(&self, tasks: Vec<PartitionTask>, cancel: &CancelFlag) -> Result<Vec<WorkerOutput>> {
        let mut handles = Vec::with_capacity(tasks.len());

        for (partition, task) in tasks.into_iter().enumerate() {
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("dbr-worker-{partition}"))
                .spawn(move || {
                    if cancel.is_cancelled() {
                        return Err(BoostError::Cancelled { partition });
                    }
                    task()
                })
                .map_err(|e| {
                    BoostError::partition(partition, format!("failed to spawn worker thread: {e}"))
                })?;
            handles.push((partition, handle));
        }

        debug!("Launched {} worker tasks", handles.len());

        let mut outputs = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (partition, handle) in handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(BoostError::partition(partition, "worker task panicked")));
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    warn!("Worker task for partition {} failed: {}", partition, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }
}
