//! raibid-agent
//!
//! Build agent core for raibid-ci. This crate handles:
//! - Registering agents and keeping them connected to the coordinator
//! - Pinging for work and running at most one job per worker
//! - Supervising job processes, with signal-based cancellation and a grace period
//! - Streaming job output back to the coordinator
//! - Running several workers as one pool with shared idle tracking
//! - Turning process signals into graceful or forceful stops

pub mod error;
pub mod idle;
pub mod log_streamer;
pub mod pool;
pub mod registration;
pub mod retry;
pub mod runner;
pub mod signals;
pub mod status;
pub mod worker;

// Re-export commonly used types
pub use error::{PoolError, RunnerError, WorkerError, WorkerFailure, WorkerResult};
pub use idle::IdleMonitor;
pub use log_streamer::{LogStreamer, StreamSummary};
pub use pool::{AgentPool, PoolStatus, Stopper};
pub use registration::{PriorityPolicy, Registration};
pub use retry::{break_if_terminal, Attempt, Backoff, Retrier, RetryError, RetryPolicy};
pub use runner::{
    CancelRequest, JobContext, JobOutcome, JobRunner, OutputSink, ProcessRunner,
    ProcessRunnerFactory, ProcessSettings, RunnerFactory,
};
pub use signals::{ReceivedSignal, SignalHandle, SignalTranslator, StopRequest};
pub use status::{StatusServer, StatusSource};
pub use worker::{
    AgentWorker, RetryPolicies, StopMode, WorkerConfig, WorkerHandle, WorkerState, WorkerStatus,
};
