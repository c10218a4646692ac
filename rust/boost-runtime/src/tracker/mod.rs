// rust/boost-runtime/src/tracker/mod.rs

//! Rendezvous tracker for one training round.
//!
//! A tracker is created per round, started before the job launches, and
//! waited on while the job runs. Its return code is the authoritative signal
//! of whether every worker finished the round.

mod client;
mod protocol;
mod socket;

pub use client::TrackerClient;
pub use protocol::{RankAssignment, WorkerMessage};
pub use socket::{SocketTracker, SocketTrackerFactory};

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub const ENV_TRACKER_URI: &str = "DMLC_TRACKER_URI";
pub const ENV_TRACKER_PORT: &str = "DMLC_TRACKER_PORT";
pub const ENV_NUM_WORKER: &str = "DMLC_NUM_WORKER";
pub const ENV_TASK_ID: &str = "DMLC_TASK_ID";

/// Every worker shut down cleanly.
pub const CODE_SUCCESS: i32 = 0;
/// A worker reported an error or disconnected before shutting down.
pub const CODE_WORKER_FAILED: i32 = 1;
/// Workers did not finish within the wait timeout.
pub const CODE_TIMEOUT: i32 = 2;
/// The tracker was stopped before the round completed.
pub const CODE_STOPPED: i32 = 3;

/// Coordination handle for one round.
pub trait Tracker: Send + Sync {
    /// Starts the tracker and waits until it is ready.
    ///
    /// Returns `Ok(false)` if it did not become ready within `timeout`
    /// (`None` waits forever).
    fn start(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Environment every worker needs to join this round.
    fn worker_env(&self) -> BTreeMap<String, String>;

    /// Blocks until the round finishes and returns its code.
    fn wait_for(&self, timeout: Option<Duration>) -> i32;

    /// Stops the tracker. Idempotent; unblocks a pending `wait_for`.
    fn stop(&self);
}

/// Creates a fresh tracker for each round.
pub trait TrackerFactory: Send + Sync {
    fn create(&self, num_workers: usize) -> Result<Arc<dyn Tracker>>;
}

/// Stops the wrapped tracker when dropped.
pub struct TrackerGuard {
    tracker: Arc<dyn Tracker>,
}

impl TrackerGuard {
    pub fn new(tracker: Arc<dyn Tracker>) -> Self {
        Self { tracker }
    }

    /// Shared handle for threads that wait on the tracker.
    pub fn handle(&self) -> Arc<dyn Tracker> {
        Arc::clone(&self.tracker)
    }
}

impl Deref for TrackerGuard {
    type Target = dyn Tracker;

    fn deref(&self) -> &Self::Target {
        self.tracker.as_ref()
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker.stop();
    }
}
