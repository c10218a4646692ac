// rust/boost-runtime/src/tracker/protocol.rs

//! Line protocol spoken between workers and the socket tracker.
//!
//! ```text
//! worker  -> tracker   start <task_id>
//! tracker -> worker    rank <rank> <world_size>
//! worker  -> tracker   shutdown <rank>
//!                    | error <rank> <message>
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{BoostError, Result};

/// A message sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Start { task_id: u32 },
    Shutdown { rank: u32 },
    Error { rank: u32, message: String },
}

/// The tracker's reply to `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankAssignment {
    pub rank: u32,
    pub world_size: u32,
}

fn parse_u32(field: Option<&str>, what: &str, line: &str) -> Result<u32> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| BoostError::tracker(format!("malformed {what} in tracker message '{line}'")))
}

impl FromStr for WorkerMessage {
    type Err = BoostError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let mut parts = line.splitn(3, ' ');
        match parts.next() {
            Some("start") => Ok(Self::Start {
                task_id: parse_u32(parts.next(), "task id", line)?,
            }),
            Some("shutdown") => Ok(Self::Shutdown {
                rank: parse_u32(parts.next(), "rank", line)?,
            }),
            Some("error") => Ok(Self::Error {
                rank: parse_u32(parts.next(), "rank", line)?,
                message: parts.next().unwrap_or("").to_string(),
            }),
            _ => Err(BoostError::tracker(format!("unknown tracker message '{line}'"))),
        }
    }
}

impl fmt::Display for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start { task_id } => write!(f, "start {task_id}"),
            Self::Shutdown { rank } => write!(f, "shutdown {rank}"),
            // Messages are single-line.
            Self::Error { rank, message } => write!(f, "error {rank} {}", message.replace('\n', " ")),
        }
    }
}

impl FromStr for RankAssignment {
    type Err = BoostError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let mut parts = line.split(' ');
        if parts.next() != Some("rank") {
            return Err(BoostError::tracker(format!("expected rank assignment, got '{line}'")));
        }
        Ok(Self {
            rank: parse_u32(parts.next(), "rank", line)?,
            world_size: parse_u32(parts.next(), "world size", line)?,
        })
    }
}

impl fmt::Display for RankAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {} {}", self.rank, self.world_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_messages() {
        assert_eq!("start 3\n".parse::<WorkerMessage>().unwrap(), WorkerMessage::Start { task_id: 3 });
        assert_eq!("shutdown 0".parse::<WorkerMessage>().unwrap(), WorkerMessage::Shutdown { rank: 0 });
        assert_eq!(
            "error 2 out of memory on device".parse::<WorkerMessage>().unwrap(),
            WorkerMessage::Error {
                rank: 2,
                message: "out of memory on device".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("hello".parse::<WorkerMessage>().is_err());
        assert!("start".parse::<WorkerMessage>().is_err());
        assert!("shutdown x".parse::<WorkerMessage>().is_err());
        assert!("rank 1".parse::<RankAssignment>().is_err());
        assert!("ranks 1 2".parse::<RankAssignment>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        let msg = WorkerMessage::Error {
            rank: 1,
            message: "line one\nline two".to_string(),
        };
        let line = msg.to_string();
        assert!(!line.contains('\n'));
        assert!(matches!(line.parse::<WorkerMessage>().unwrap(), WorkerMessage::Error { rank: 1, .. }));

        let assignment = RankAssignment { rank: 2, world_size: 4 };
        assert_eq!(assignment.to_string().parse::<RankAssignment>().unwrap(), assignment);
    }
}
