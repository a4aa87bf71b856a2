//! Agent worker
//!
//! One [`AgentWorker`] owns one agent identity. It registers (unless built
//! with an identity), connects, pings the coordinator for work, runs at most
//! one job at a time, and disconnects.
//!
//! ```text
//! Idle -> Connecting -> WaitingForWork <-> Running
//!                              |              |
//!                              +--> Disconnecting -> Disconnected
//! ```
//!
//! A stop request is orthogonal to the state. Waiting for work, any stop
//! ends the loop at once. While running, a forceful stop cancels the job
//! immediately and a graceful one lets it run for the grace period first.

mod config;
mod heartbeat;
mod job;
mod state;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use raibid_common::{AgentIdentity, Coordinator, PingAction};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::idle::IdleMonitor;
use crate::registration;
use crate::retry::{break_if_terminal, Retrier, RetryError};
use crate::runner::RunnerFactory;

pub use config::{RetryPolicies, WorkerConfig};
pub use state::{StopMode, WorkerHandle, WorkerState, WorkerStatus};

use heartbeat::Heartbeat;

/// What the ping loop does next
enum Next {
    Continue,
    Disconnect,
}

pub struct AgentWorker {
    config: WorkerConfig,
    coordinator: Arc<dyn Coordinator>,
    runners: Arc<dyn RunnerFactory>,
    idle: Arc<IdleMonitor>,
    identity: Option<AgentIdentity>,
    handle: WorkerHandle,
    connected: bool,
    started: bool,
}

impl AgentWorker {
    pub fn new(
        config: WorkerConfig,
        coordinator: Arc<dyn Coordinator>,
        runners: Arc<dyn RunnerFactory>,
    ) -> Self {
        let handle = WorkerHandle::new(config.registration.name.clone());
        Self {
            config,
            coordinator,
            runners,
            idle: Arc::new(IdleMonitor::new(1)),
            identity: None,
            handle,
            connected: false,
            started: false,
        }
    }

    /// Use an identity registered earlier instead of registering again
    pub fn with_identity(mut self, identity: AgentIdentity) -> Self {
        self.handle.set_name(&identity.name);
        self.identity = Some(identity);
        self
    }

    /// Share a pool-wide idle monitor
    pub fn with_idle_monitor(mut self, idle: Arc<IdleMonitor>) -> Self {
        self.idle = idle;
        self
    }

    pub fn name(&self) -> String {
        self.handle.name()
    }

    pub fn identity(&self) -> Option<&AgentIdentity> {
        self.identity.as_ref()
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// See [`WorkerHandle::stop`]
    pub fn stop(&self, graceful: bool) {
        self.handle.stop(graceful);
    }

    /// Register if needed, then connect
    ///
    /// A stop request while connecting is not an error: the worker simply
    /// never starts.
    pub async fn connect(&mut self) -> WorkerResult<()> {
        self.handle.set_state(WorkerState::Connecting);
        let stopped = self.handle.stopped().clone();

        let identity = match self.identity.clone() {
            Some(identity) => identity,
            None => {
                let registered = registration::register(
                    self.coordinator.as_ref(),
                    &self.config.registration,
                    self.config.retry.register.clone(),
                    &stopped,
                )
                .await;

                match registered {
                    Ok(identity) => {
                        self.handle.set_name(&identity.name);
                        self.identity = Some(identity.clone());
                        identity
                    }
                    Err(e) if e.is_cancelled() => {
                        self.abandon_connect();
                        return Ok(());
                    }
                    Err(e) => {
                        self.handle.set_state(WorkerState::Disconnected);
                        return Err(WorkerError::Register(e));
                    }
                }
            }
        };

        let coordinator = self.coordinator.as_ref();
        let connected = Retrier::new("connect", self.config.retry.connect.clone())
            .run_with_cancel(&stopped, |attempt| {
                let identity = &identity;
                async move {
                    coordinator
                        .connect(identity)
                        .await
                        .map_err(|e| break_if_terminal(&attempt, e))
                }
            })
            .await;

        match connected {
            Ok(()) => {
                info!(agent = %identity.name, "Agent connected");
                self.connected = true;
                self.handle.set_state(WorkerState::WaitingForWork);
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                self.abandon_connect();
                Ok(())
            }
            Err(e) => {
                self.handle.set_state(WorkerState::Disconnected);
                Err(WorkerError::Connect(e))
            }
        }
    }

    fn abandon_connect(&mut self) {
        info!(worker = %self.name(), "Stopped before connecting");
        self.handle.set_state(WorkerState::Disconnected);
    }

    /// Ping for work and run jobs until stopped or told to disconnect
    pub async fn start(&mut self) -> WorkerResult<()> {
        if self.started {
            return Err(WorkerError::AlreadyStarted);
        }
        self.started = true;

        let Some(identity) = self.identity.clone().filter(|_| self.connected) else {
            return Ok(());
        };

        let heartbeat = Heartbeat::spawn(
            Arc::clone(&self.coordinator),
            identity.clone(),
            self.config.retry.heartbeat.clone(),
        );
        let result = self.ping_loop(&identity).await;
        heartbeat.stop().await;

        if let Err(e) = &result {
            warn!(agent = %identity.name, error = %e, "Worker stopped with an error");
        }
        result
    }

    async fn ping_loop(&self, identity: &AgentIdentity) -> WorkerResult<()> {
        let stopped = self.handle.stopped().clone();
        let mut delay = self.first_ping_delay(identity.ping_interval());
        let mut idle_since = Instant::now();

        loop {
            if self.handle.stop_mode().is_requested() {
                info!(agent = %identity.name, "Stop requested, no longer accepting work");
                return Ok(());
            }

            if !delay.is_zero() {
                tokio::select! {
                    _ = stopped.cancelled() => continue,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            delay = identity.ping_interval();

            let coordinator = self.coordinator.as_ref();
            let pinged = Retrier::new("ping", self.config.retry.ping.clone())
                .run_with_cancel(&stopped, |attempt| async move {
                    coordinator
                        .ping(identity)
                        .await
                        .map_err(|e| break_if_terminal(&attempt, e))
                })
                .await;

            let response = match pinged {
                Ok(response) => response,
                Err(e) if e.is_cancelled() => continue,
                Err(RetryError::Aborted { source, .. }) => {
                    return Err(WorkerError::Rejected(source));
                }
                Err(e) => {
                    warn!(agent = %identity.name, error = %e, "Ping failed, trying again next interval");
                    continue;
                }
            };

            match response.action {
                PingAction::Disconnect => {
                    info!(agent = %identity.name, "Coordinator asked agent to disconnect");
                    return Ok(());
                }
                PingAction::Pause => {
                    debug!(agent = %identity.name, "Agent paused");
                    continue;
                }
                PingAction::Idle => {}
            }

            if let Some(job) = response.job {
                if self.handle.stop_mode().is_requested() {
                    info!(agent = %identity.name, job_id = %job.id, "Stopping, leaving offered job");
                    return Ok(());
                }

                let ran = self.run_job(identity, job).await;
                idle_since = Instant::now();
                if ran && self.config.disconnect_after_job {
                    info!(agent = %identity.name, "Job finished, disconnecting as configured");
                    return Ok(());
                }
                // Look for more work straight away, but not after a rejected accept
                if ran {
                    delay = Duration::ZERO;
                }
                continue;
            }

            if let Next::Disconnect = self.check_idle_timeout(identity, idle_since) {
                return Ok(());
            }
        }
    }

    fn check_idle_timeout(&self, identity: &AgentIdentity, idle_since: Instant) -> Next {
        let timeout = self.config.disconnect_after_idle_timeout;
        if timeout.is_zero() || idle_since.elapsed() < timeout {
            return Next::Continue;
        }
        if !self.idle.is_idle() {
            debug!(agent = %identity.name, "Idle timeout reached but the pool is busy");
            return Next::Continue;
        }

        info!(
            agent = %identity.name,
            idle_secs = idle_since.elapsed().as_secs(),
            "Idle timeout reached, disconnecting"
        );
        Next::Disconnect
    }

    fn first_ping_delay(&self, interval: Duration) -> Duration {
        let millis = interval.as_millis() as u64;
        if !self.config.ping_jitter || millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..millis))
    }

    /// Tell the coordinator the agent is gone
    ///
    /// Failures are logged; the worker ends up disconnected either way.
    pub async fn disconnect(&mut self) {
        if let (true, Some(identity)) = (self.connected, self.identity.as_ref()) {
            self.handle.set_state(WorkerState::Disconnecting);
            info!(agent = %identity.name, "Disconnecting agent");

            let coordinator = self.coordinator.as_ref();
            let result = Retrier::new("disconnect", self.config.retry.disconnect.clone())
                .run(|attempt| async move {
                    coordinator
                        .disconnect(identity)
                        .await
                        .map_err(|e| break_if_terminal(&attempt, e))
                })
                .await;

            if let Err(e) = result {
                warn!(agent = %identity.name, error = %e, "Failed to disconnect cleanly");
            }
            self.connected = false;
        }
        self.handle.set_state(WorkerState::Disconnected);
    }
}

impl std::fmt::Debug for AgentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentWorker")
            .field("index", &self.config.index)
            .field("handle", &self.handle)
            .field("connected", &self.connected)
            .finish()
    }
}
