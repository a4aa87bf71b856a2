//! Worker lifecycle state and the handle used to stop a worker

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lifecycle of an agent worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Built, not yet connected
    Idle,
    Connecting,
    /// Pinging for work
    WaitingForWork,
    /// Running a job
    Running,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::WaitingForWork => "waiting_for_work",
            Self::Running => "running",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Requested stop, ordered by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    #[default]
    None,
    /// Finish the current job, take no new work
    Graceful,
    /// Cancel the current job now
    Forceful,
}

impl StopMode {
    /// Mode after another stop request
    ///
    /// Any request on top of a pending graceful stop is forceful, and
    /// nothing ever lowers the mode.
    pub fn escalate(self, graceful: bool) -> Self {
        match (self, graceful) {
            (Self::None, true) => Self::Graceful,
            (Self::None, false) => Self::Forceful,
            (Self::Graceful, _) | (Self::Forceful, _) => Self::Forceful,
        }
    }

    pub fn is_requested(self) -> bool {
        self != Self::None
    }
}

/// Snapshot of a worker for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    pub stopping: bool,
    pub job_id: Option<String>,
}

/// Cloneable control surface of one worker
///
/// The pool keeps one per worker to fan out stop requests and read status
/// while the worker itself runs in its own task.
#[derive(Clone)]
pub struct WorkerHandle {
    stop_tx: Arc<watch::Sender<StopMode>>,
    stopped: CancellationToken,
    status: Arc<Mutex<WorkerStatus>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String) -> Self {
        let (stop_tx, _) = watch::channel(StopMode::None);
        Self {
            stop_tx: Arc::new(stop_tx),
            stopped: CancellationToken::new(),
            status: Arc::new(Mutex::new(WorkerStatus {
                name,
                state: WorkerState::Idle,
                stopping: false,
                job_id: None,
            })),
        }
    }

    /// Ask the worker to stop
    ///
    /// Safe to call any number of times from any task.
    pub fn stop(&self, graceful: bool) {
        let mut escalated_to = None;
        self.stop_tx.send_if_modified(|mode| {
            let next = mode.escalate(graceful);
            if next == *mode {
                return false;
            }
            *mode = next;
            escalated_to = Some(next);
            true
        });

        let Some(mode) = escalated_to else {
            debug!(worker = %self.name(), "Stop already in effect");
            return;
        };

        info!(worker = %self.name(), mode = ?mode, "Stop requested");
        self.status.lock().stopping = true;
        self.stopped.cancel();
    }

    pub fn stop_mode(&self) -> StopMode {
        *self.stop_tx.borrow()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    pub fn name(&self) -> String {
        self.status.lock().name.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.status.lock().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<StopMode> {
        self.stop_tx.subscribe()
    }

    /// Cancelled by the first stop request
    pub(crate) fn stopped(&self) -> &CancellationToken {
        &self.stopped
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.status.lock().name = name.to_string();
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let mut status = self.status.lock();
        if status.state != state {
            debug!(worker = %status.name, from = %status.state, to = %state, "Worker state");
            status.state = state;
        }
    }

    pub(crate) fn set_job(&self, job_id: Option<String>) {
        self.status.lock().job_id = job_id;
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("status", &self.status())
            .field("stop_mode", &self.stop_mode())
            .finish()
    }
}
