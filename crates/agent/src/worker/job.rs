//! Running one job: accept, report, supervise, report again

use std::sync::Arc;

use chrono::Utc;
use raibid_common::{AgentIdentity, JobAssignment, JobStatusReport, SignalReason};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{AgentWorker, StopMode, WorkerState};
use crate::idle::IdleMonitor;
use crate::log_streamer::{LogStreamer, OUTPUT_CHANNEL_CAPACITY};
use crate::retry::{break_if_terminal, Retrier};
use crate::runner::{CancelRequest, JobContext, JobOutcome, JobRunner};

/// Marks the pool busy for as long as it lives
struct BusyGuard<'a>(&'a IdleMonitor);

impl<'a> BusyGuard<'a> {
    fn new(idle: &'a IdleMonitor) -> Self {
        idle.mark_busy();
        Self(idle)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_idle();
    }
}

/// Cancellation progress of the running job
#[derive(Debug, Default)]
struct CancelState {
    /// Cancel request already handed to the runner
    sent: bool,
    /// When a graceful stop turns into a cancel
    deadline: Option<Instant>,
}

impl AgentWorker {
    /// Accept and run an offered job
    ///
    /// Returns false when the job could not be accepted. Failures of the job
    /// itself are reported to the coordinator, never returned.
    pub(super) async fn run_job(&self, identity: &AgentIdentity, offer: JobAssignment) -> bool {
        let Some(job) = self.accept(identity, &offer.id).await else {
            return false;
        };

        let job_id = job.id.clone();
        let _busy = BusyGuard::new(&self.idle);
        self.handle.set_job(Some(job_id.clone()));
        self.handle.set_state(WorkerState::Running);
        info!(agent = %identity.name, job_id = %job_id, "Running job");

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let streamer = LogStreamer::start(
            Arc::clone(&self.coordinator),
            identity.clone(),
            job_id.clone(),
            output_rx,
            self.config.retry.upload.clone(),
        );

        self.report(identity, &job_id, &JobStatusReport::started()).await;

        let context = JobContext {
            job,
            agent_id: identity.id.clone(),
            agent_name: identity.name.clone(),
        };
        let outcome = match self.runners.create(context, output_tx) {
            Ok(runner) => self.supervise(identity, &job_id, runner).await,
            Err(e) => {
                error!(agent = %identity.name, job_id = %job_id, error = %e, "Failed to prepare job");
                JobOutcome::run_error()
            }
        };

        let summary = streamer.finish().await;
        let finished = JobStatusReport::Finished {
            exit_status: outcome.exit_status,
            signal: outcome.signal.clone(),
            signal_reason: outcome.signal_reason,
            chunks_failed_count: summary.chunks_failed,
            finished_at: Utc::now(),
        };
        self.report(identity, &job_id, &finished).await;

        info!(
            agent = %identity.name,
            job_id = %job_id,
            passed = outcome.passed(),
            exit_status = outcome.exit_status,
            signal = outcome.signal.as_deref().unwrap_or(""),
            "Job finished"
        );

        self.handle.set_job(None);
        self.handle.set_state(WorkerState::WaitingForWork);
        true
    }

    async fn accept(&self, identity: &AgentIdentity, job_id: &str) -> Option<JobAssignment> {
        let coordinator = self.coordinator.as_ref();
        let accepted = Retrier::new("accept job", self.config.retry.accept.clone())
            .run(|attempt| async move {
                coordinator
                    .accept_job(identity, job_id)
                    .await
                    .map_err(|e| break_if_terminal(&attempt, e))
            })
            .await;

        match accepted {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(agent = %identity.name, job_id = %job_id, error = %e, "Could not accept job");
                None
            }
        }
    }

    /// Send a status transition, retrying transient failures
    async fn report(&self, identity: &AgentIdentity, job_id: &str, status: &JobStatusReport) {
        let coordinator = self.coordinator.as_ref();
        let result = Retrier::new(
            format!("report job {}", status.kind()),
            self.config.retry.report.clone(),
        )
        .run(|attempt| async move {
            coordinator
                .report_job_status(identity, job_id, status)
                .await
                .map_err(|e| break_if_terminal(&attempt, e))
        })
        .await;

        if let Err(e) = result {
            error!(
                agent = %identity.name,
                job_id = %job_id,
                status = status.kind(),
                error = %e,
                "Failed to report job status"
            );
        }
    }

    /// Wait for the runner while watching for stop requests and remote cancellation
    async fn supervise(
        &self,
        identity: &AgentIdentity,
        job_id: &str,
        runner: Arc<dyn JobRunner>,
    ) -> JobOutcome {
        let mut stop_rx = self.handle.subscribe();
        let mut cancel = CancelState::default();
        let initial = *stop_rx.borrow_and_update();
        self.on_stop(initial, runner.as_ref(), &mut cancel, job_id);

        let status_interval = identity.job_status_interval();
        let mut status_ticker =
            tokio::time::interval_at(Instant::now() + status_interval, status_interval);
        status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut run = runner.run();
        let mut stop_open = true;

        loop {
            tokio::select! {
                result = &mut run => {
                    return match result {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(agent = %identity.name, job_id = %job_id, error = %e, "Job failed to run");
                            JobOutcome::run_error()
                        }
                    };
                }
                changed = stop_rx.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                        continue;
                    }
                    let mode = *stop_rx.borrow_and_update();
                    self.on_stop(mode, runner.as_ref(), &mut cancel, job_id);
                }
                _ = sleep_until(cancel.deadline), if cancel.deadline.is_some() => {
                    info!(job_id = %job_id, "Job still running after the grace period");
                    cancel.deadline = None;
                    self.cancel_job(runner.as_ref(), &mut cancel, SignalReason::AgentStop, job_id);
                }
                _ = status_ticker.tick(), if !cancel.sent => {
                    if self.remotely_cancelled(identity, job_id).await {
                        self.cancel_job(runner.as_ref(), &mut cancel, SignalReason::Cancel, job_id);
                    }
                }
            }
        }
    }

    fn on_stop(&self, mode: StopMode, runner: &dyn JobRunner, cancel: &mut CancelState, job_id: &str) {
        match mode {
            StopMode::None => {}
            StopMode::Forceful => {
                cancel.deadline = None;
                self.cancel_job(runner, cancel, SignalReason::AgentStop, job_id);
            }
            StopMode::Graceful => {
                if cancel.sent || cancel.deadline.is_some() {
                    return;
                }
                info!(
                    job_id = %job_id,
                    grace_period_ms = self.config.cancel_grace_period.as_millis() as u64,
                    "Waiting for the running job before stopping"
                );
                cancel.deadline = Some(Instant::now() + self.config.cancel_grace_period);
            }
        }
    }

    fn cancel_job(
        &self,
        runner: &dyn JobRunner,
        cancel: &mut CancelState,
        reason: SignalReason,
        job_id: &str,
    ) {
        if cancel.sent {
            return;
        }
        cancel.sent = true;
        info!(job_id = %job_id, reason = %reason, signal = %self.config.cancel_signal, "Cancelling job");
        runner.cancel(CancelRequest {
            signal: self.config.cancel_signal,
            grace_period: self.config.cancel_grace_period,
            reason,
        });
    }

    async fn remotely_cancelled(&self, identity: &AgentIdentity, job_id: &str) -> bool {
        match self.coordinator.job_state(identity, job_id).await {
            Ok(state) if state.is_cancellation() => {
                info!(job_id = %job_id, state = ?state, "Job cancelled by the coordinator");
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Could not check job state");
                false
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
