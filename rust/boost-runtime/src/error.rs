// rust/boost-runtime/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoostError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Partition {partition}: {message}")]
    Partition {
        partition: usize,
        message: String,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("Tracker error: {message}")]
    Tracker {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Training failed: tracker returned code {code} in round ending at {round}")]
    TrackerExit {
        code: i32,
        round: u32,
    },

    #[error("Native library error: {message}")]
    Native {
        message: String,
    },

    #[error("Workers disagree on round {round} result: {message}")]
    Inconsistent {
        round: u32,
        message: String,
    },

    #[error("Task for partition {partition} was cancelled before it started")]
    Cancelled {
        partition: usize,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, BoostError>;

// Convenience constructors
impl BoostError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn partition(partition: usize, message: impl Into<String>) -> Self {
        Self::Partition {
            partition,
            message: message.into(),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn tracker(message: impl Into<String>) -> Self {
        Self::Tracker {
            message: message.into(),
            source: None,
        }
    }

    pub fn tracker_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Tracker {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::Native {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
