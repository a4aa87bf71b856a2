//! Error types for the agent core

use std::fmt;

use raibid_common::ApiError;
use thiserror::Error;

use crate::retry::RetryError;

/// Failure of a single agent worker
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to register agent: {0}")]
    Register(#[source] RetryError<ApiError>),

    #[error("failed to connect agent: {0}")]
    Connect(#[source] RetryError<ApiError>),

    #[error("agent rejected by coordinator while pinging: {0}")]
    Rejected(#[source] ApiError),

    #[error("worker was already started")]
    AlreadyStarted,

    #[error("worker task panicked: {0}")]
    Panicked(String),
}

/// Errors starting or supervising a job's process
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to prepare build directory {path}: {source}")]
    BuildDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn job process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for job process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to allocate pseudo-terminal: {0}")]
    Pty(String),

    #[error("failed to signal job process: {0}")]
    Signal(String),

    #[error("empty shell command")]
    EmptyShell,
}

/// A worker that ended with an error, named for reporting
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker: String,
    pub error: WorkerError,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.worker, self.error)
    }
}

/// Errors from an agent pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker that failed, in the order they finished
    #[error("{} of {total} agent workers failed: {}", .failures.len(), join_failures(.failures))]
    Workers {
        total: usize,
        failures: Vec<WorkerFailure>,
    },

    #[error("agent pool was already started")]
    AlreadyStarted,
}

impl PoolError {
    /// Individual worker failures, empty for non-worker errors
    pub fn failures(&self) -> &[WorkerFailure] {
        match self {
            Self::Workers { failures, .. } => failures,
            Self::AlreadyStarted => &[],
        }
    }
}

fn join_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
