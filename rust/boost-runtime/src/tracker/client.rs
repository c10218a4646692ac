// rust/boost-runtime/src/tracker/client.rs

//! Worker side of the socket tracker protocol.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use tracing::debug;

use super::protocol::{RankAssignment, WorkerMessage};
use super::{ENV_TASK_ID, ENV_TRACKER_PORT, ENV_TRACKER_URI};
use crate::error::{BoostError, Result};
use crate::native::CollectiveSession;

/// A worker's registration with the round's tracker.
///
/// Call [`TrackerClient::shutdown`] when the worker's part of the round is
/// done. Dropping the client without it reports an error to the tracker, so
/// a worker that bails out early fails the round instead of hanging it.
pub struct TrackerClient {
    writer: TcpStream,
    // Kept open until the client is dropped.
    _reader: BufReader<TcpStream>,
    assignment: RankAssignment,
    finished: bool,
}

impl TrackerClient {
    /// Connects using `DMLC_TRACKER_URI`, `DMLC_TRACKER_PORT` and
    /// `DMLC_TASK_ID` (default 0) from `env`.
    pub fn connect(env: &BTreeMap<String, String>) -> Result<Self> {
        let uri = env
            .get(ENV_TRACKER_URI)
            .ok_or_else(|| BoostError::tracker(format!("{ENV_TRACKER_URI} is not set")))?;
        let port: u16 = env
            .get(ENV_TRACKER_PORT)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| BoostError::tracker(format!("{ENV_TRACKER_PORT} is missing or invalid")))?;
        let task_id: u32 = match env.get(ENV_TASK_ID) {
            Some(id) => id
                .parse()
                .map_err(|_| BoostError::tracker(format!("invalid {ENV_TASK_ID} '{id}'")))?,
            None => 0,
        };

        let stream = TcpStream::connect((uri.as_str(), port)).map_err(|e| {
            BoostError::tracker_with_source(format!("failed to connect to tracker at {uri}:{port}"), e)
        })?;
        let mut writer = stream
            .try_clone()
            .map_err(|e| BoostError::tracker_with_source("failed to clone tracker connection", e))?;
        let mut reader = BufReader::new(stream);

        send(&mut writer, &WorkerMessage::Start { task_id })?;

        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| BoostError::tracker_with_source("failed to read rank assignment", e))?;
        if read == 0 {
            return Err(BoostError::tracker(
                "tracker closed the connection before assigning a rank",
            ));
        }
        let assignment: RankAssignment = line.parse()?;
        debug!(
            "Task {} joined as rank {} of {}",
            task_id, assignment.rank, assignment.world_size
        );

        Ok(Self {
            writer,
            _reader: reader,
            assignment,
            finished: false,
        })
    }

    pub fn rank(&self) -> u32 {
        self.assignment.rank
    }

    pub fn world_size(&self) -> u32 {
        self.assignment.world_size
    }

    /// Reports a clean exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.finished = true;
        let rank = self.assignment.rank;
        send(&mut self.writer, &WorkerMessage::Shutdown { rank })
    }

    /// Reports a failure; the tracker fails the round.
    pub fn report_error(mut self, message: &str) -> Result<()> {
        self.finished = true;
        let rank = self.assignment.rank;
        send(
            &mut self.writer,
            &WorkerMessage::Error {
                rank,
                message: message.to_string(),
            },
        )
    }
}

fn send(writer: &mut TcpStream, message: &WorkerMessage) -> Result<()> {
    writeln!(writer, "{message}")
        .and_then(|()| writer.flush())
        .map_err(|e| BoostError::tracker_with_source("failed to write to tracker", e))
}

impl Drop for TrackerClient {
    fn drop(&mut self) {
        if !self.finished {
            let message = WorkerMessage::Error {
                rank: self.assignment.rank,
                message: "worker exited without shutdown".to_string(),
            };
            let _ = send(&mut self.writer, &message);
        }
    }
}

impl CollectiveSession for TrackerClient {
    fn rank(&self) -> u32 {
        self.assignment.rank
    }

    fn world_size(&self) -> u32 {
        self.assignment.world_size
    }

    fn shutdown(self: Box<Self>) -> Result<()> {
        TrackerClient::shutdown(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::tracker::{SocketTracker, Tracker, CODE_SUCCESS, CODE_WORKER_FAILED};
    use std::time::Duration;

    fn started_tracker(num_workers: usize) -> SocketTracker {
        let tracker = SocketTracker::new(&TrackerConfig::default(), num_workers).unwrap();
        assert!(tracker.start(Some(Duration::from_secs(5))).unwrap());
        tracker
    }

    #[test]
    fn test_connect_requires_env() {
        assert!(TrackerClient::connect(&BTreeMap::new()).is_err());

        let mut env = BTreeMap::new();
        env.insert(ENV_TRACKER_URI.to_string(), "127.0.0.1".to_string());
        env.insert(ENV_TRACKER_PORT.to_string(), "not-a-port".to_string());
        assert!(TrackerClient::connect(&env).is_err());
    }

    #[test]
    fn test_invalid_task_id() {
        let tracker = started_tracker(1);
        let mut env = tracker.worker_env();
        env.insert(ENV_TASK_ID.to_string(), "abc".to_string());
        assert!(TrackerClient::connect(&env).is_err());
    }

    #[test]
    fn test_boxed_session_shutdown() {
        let tracker = started_tracker(1);
        let session: Box<dyn CollectiveSession> =
            Box::new(TrackerClient::connect(&tracker.worker_env()).unwrap());
        assert_eq!(session.rank(), 0);
        assert_eq!(session.world_size(), 1);
        session.shutdown().unwrap();

        assert_eq!(tracker.wait_for(Some(Duration::from_secs(10))), CODE_SUCCESS);
    }

    #[test]
    fn test_drop_without_shutdown_reports_failure() {
        let tracker = started_tracker(1);
        {
            let _client = TrackerClient::connect(&tracker.worker_env()).unwrap();
        }
        assert_eq!(tracker.wait_for(Some(Duration::from_secs(10))), CODE_WORKER_FAILED);
    }
}
