//! Job runner contract
//!
//! A [`JobRunner`] executes one job. The worker awaits [`JobRunner::run`]
//! and may call [`JobRunner::cancel`] at any point from the same task; run
//! always returns, whether or not cancel was called.
//!
//! Cancellation sends the requested signal to the job's process tree at
//! once and a kill-class signal after the grace period if anything is still
//! alive. That kill is the only hard timeout applied to a job.

mod process;
#[cfg(unix)]
mod pty;
mod signal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raibid_common::{JobAssignment, ProcessSignal, SignalReason};
use tokio::sync::mpsc;

use crate::error::RunnerError;

pub use process::{ProcessRunner, ProcessRunnerFactory};

/// Where job output is written
pub type OutputSink = mpsc::Sender<Vec<u8>>;

/// Terminal status of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Process exit code, -1 when the process died of a signal or never ran
    pub exit_status: i32,
    /// Name of the signal that ended the process
    pub signal: Option<String>,
    pub signal_reason: Option<SignalReason>,
}

impl JobOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_status: code,
            signal: None,
            signal_reason: None,
        }
    }

    /// Outcome for a job whose process never started
    pub fn run_error() -> Self {
        Self {
            exit_status: -1,
            signal: None,
            signal_reason: Some(SignalReason::ProcessRunError),
        }
    }

    pub fn passed(&self) -> bool {
        self.exit_status == 0
    }
}

/// How a running job should be stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub signal: ProcessSignal,
    pub grace_period: Duration,
    pub reason: SignalReason,
}

/// Everything a runner needs to know about the job and who runs it
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobAssignment,
    pub agent_id: String,
    pub agent_name: String,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job to completion
    async fn run(&self) -> Result<JobOutcome, RunnerError>;

    /// Ask the job to stop. Returns immediately; later calls are ignored.
    fn cancel(&self, request: CancelRequest);
}

/// Builds a runner for each accepted job
pub trait RunnerFactory: Send + Sync {
    fn create(
        &self,
        context: JobContext,
        output: OutputSink,
    ) -> Result<Arc<dyn JobRunner>, RunnerError>;
}

/// Settings shared by every process runner of a worker
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub build_path: PathBuf,
    /// Shell program plus leading arguments, e.g. `["/bin/sh", "-c"]`
    pub shell: Vec<String>,
    pub pty: bool,
}

impl ProcessSettings {
    pub fn new(build_path: impl Into<PathBuf>, shell: &str, pty: bool) -> Self {
        Self {
            build_path: build_path.into(),
            shell: shell.split_whitespace().map(str::to_string).collect(),
            pty,
        }
    }
}
