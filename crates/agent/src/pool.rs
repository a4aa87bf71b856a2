//! Agent pool
//!
//! Runs N workers side by side, one task each. The pool fans stop requests
//! out to every worker and collects every worker's terminal error.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::{PoolError, WorkerError, WorkerFailure};
use crate::idle::IdleMonitor;
use crate::worker::{AgentWorker, WorkerHandle, WorkerState, WorkerStatus};

/// Aggregate pool state served by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// True iff no worker is running a job
    pub idle: bool,
    /// Number of workers running a job
    pub busy: usize,
    pub workers: Vec<WorkerStatus>,
}

/// Something that can be asked to stop
///
/// Lets the signal translator drive a pool without owning it.
pub trait Stopper: Send + Sync {
    fn stop(&self, graceful: bool);
}

pub struct AgentPool {
    workers: Mutex<Option<Vec<AgentWorker>>>,
    handles: Vec<WorkerHandle>,
    idle: Arc<IdleMonitor>,
}

impl AgentPool {
    /// Build a pool sharing one idle monitor across `workers`
    pub fn new(workers: Vec<AgentWorker>) -> Self {
        let idle = Arc::new(IdleMonitor::new(workers.len()));
        let workers: Vec<AgentWorker> = workers
            .into_iter()
            .map(|worker| worker.with_idle_monitor(Arc::clone(&idle)))
            .collect();
        let handles = workers.iter().map(AgentWorker::handle).collect();

        Self {
            workers: Mutex::new(Some(workers)),
            handles,
            idle,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn idle_monitor(&self) -> Arc<IdleMonitor> {
        Arc::clone(&self.idle)
    }

    /// Run every worker to completion
    ///
    /// Each worker connects, runs and always disconnects, whatever way its
    /// run ends. Returns `Ok` only if every worker finished cleanly;
    /// otherwise the error carries every failure.
    pub async fn start(&self) -> Result<(), PoolError> {
        let workers = self.workers.lock().take().ok_or(PoolError::AlreadyStarted)?;
        let total = workers.len();
        info!(workers = total, "Starting agent pool");

        let mut tasks = JoinSet::new();
        for (slot, worker) in workers.into_iter().enumerate() {
            tasks.spawn(async move {
                let result = AssertUnwindSafe(run_worker(worker))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(&*panic))));
                (slot, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((slot, Err(error))) => {
                    let worker = self.handles[slot].name();
                    error!(worker = %worker, error = %error, "Agent worker failed");
                    failures.push(WorkerFailure { worker, error });
                }
                Err(e) => {
                    error!(error = %e, "Agent worker task did not complete");
                    failures.push(WorkerFailure {
                        worker: "unknown".to_string(),
                        error: WorkerError::Panicked(e.to_string()),
                    });
                }
            }
        }

        if failures.is_empty() {
            info!("All agent workers finished");
            Ok(())
        } else {
            Err(PoolError::Workers { total, failures })
        }
    }

    /// Stop every worker
    ///
    /// Safe to call repeatedly and from any task. A graceful stop never
    /// downgrades an earlier forceful one.
    pub fn stop(&self, graceful: bool) {
        info!(graceful, workers = self.handles.len(), "Stopping agent pool");
        for handle in &self.handles {
            handle.stop(graceful);
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            idle: self.idle.is_idle(),
            busy: self.idle.busy_count(),
            workers: self.handles.iter().map(WorkerHandle::status).collect(),
        }
    }

    /// True once every worker has disconnected
    pub fn is_finished(&self) -> bool {
        self.handles
            .iter()
            .all(|handle| handle.state() == WorkerState::Disconnected)
    }
}

impl Stopper for AgentPool {
    fn stop(&self, graceful: bool) {
        AgentPool::stop(self, graceful);
    }
}

/// Connect, run, and always disconnect one worker
///
/// A panic while connecting or running still disconnects.
async fn run_worker(mut worker: AgentWorker) -> Result<(), WorkerError> {
    let result = AssertUnwindSafe(async {
        worker.connect().await?;
        worker.start().await
    })
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(&*panic))));

    worker.disconnect().await;
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
