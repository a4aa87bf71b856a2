//! Process-backed job runner
//!
//! Runs the job script through the configured shell in its own process
//! group, streams its output, and enforces cancellation with a grace period.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use raibid_common::{ProcessSignal, SignalReason};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::signal::{signal_process_group, signal_process_tree};
use super::{CancelRequest, JobContext, JobOutcome, JobRunner, OutputSink, ProcessSettings, RunnerFactory};
use crate::error::RunnerError;

/// How long to wait for output readers once the process has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a [`ProcessRunner`] per job
#[derive(Debug, Clone)]
pub struct ProcessRunnerFactory {
    settings: ProcessSettings,
}

impl ProcessRunnerFactory {
    pub fn new(settings: ProcessSettings) -> Self {
        Self { settings }
    }
}

impl RunnerFactory for ProcessRunnerFactory {
    fn create(
        &self,
        context: JobContext,
        output: OutputSink,
    ) -> Result<Arc<dyn JobRunner>, RunnerError> {
        if self.settings.shell.is_empty() {
            return Err(RunnerError::EmptyShell);
        }
        Ok(Arc::new(ProcessRunner::new(
            self.settings.clone(),
            context,
            output,
        )))
    }
}

/// Runs one job as a shell process
pub struct ProcessRunner {
    settings: ProcessSettings,
    context: JobContext,
    output: Mutex<Option<OutputSink>>,
    cancel_tx: watch::Sender<Option<CancelRequest>>,
}

impl ProcessRunner {
    pub fn new(settings: ProcessSettings, context: JobContext, output: OutputSink) -> Self {
        let (cancel_tx, _) = watch::channel(None);
        Self {
            settings,
            context,
            output: Mutex::new(Some(output)),
            cancel_tx,
        }
    }

    /// Working directory for this job
    pub fn build_dir(&self) -> PathBuf {
        self.settings
            .build_path
            .join(sanitize(&self.context.agent_name))
            .join(sanitize(&self.context.job.id))
    }

    fn command(&self, build_dir: &Path) -> Result<Command, RunnerError> {
        let (program, args) = self
            .settings
            .shell
            .split_first()
            .ok_or(RunnerError::EmptyShell)?;

        let job = &self.context.job;
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&job.command)
            .current_dir(build_dir)
            .envs(&job.env)
            .env("RAIBID_JOB_ID", &job.id)
            .env("RAIBID_AGENT_ID", &self.context.agent_id)
            .env("RAIBID_AGENT_NAME", &self.context.agent_name)
            .env("RAIBID_BUILD_PATH", &self.settings.build_path)
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        Ok(command)
    }

    /// Start the process and the tasks copying its output
    fn spawn(
        &self,
        build_dir: &Path,
        output: OutputSink,
    ) -> Result<(Child, Vec<JoinHandle<()>>), RunnerError> {
        let mut command = self.command(build_dir)?;

        #[cfg(unix)]
        if self.settings.pty {
            let (master, stdio) = super::pty::Pty::open()?.split()?;
            command
                .stdin(stdio.stdin)
                .stdout(stdio.stdout)
                .stderr(stdio.stderr);
            let child = command.spawn().map_err(RunnerError::Spawn)?;
            // Closes our copies of the slave
            drop(command);
            let reader = super::pty::spawn_master_reader(master, output);
            return Ok((child, vec![reader]));
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(RunnerError::Spawn)?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_pipe_reader(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_pipe_reader(stderr, output));
        }

        Ok((child, readers))
    }
}

#[async_trait]
impl JobRunner for ProcessRunner {
    async fn run(&self) -> Result<JobOutcome, RunnerError> {
        let output = self.output.lock().take().ok_or_else(|| {
            RunnerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "job runner already used",
            ))
        })?;

        let build_dir = self.build_dir();
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|source| RunnerError::BuildDir {
                path: build_dir.display().to_string(),
                source,
            })?;

        let (mut child, readers) = self.spawn(&build_dir, output)?;
        // The leader's pid names its group even after it is reaped
        let group = child.id();
        info!(
            job_id = %self.context.job.id,
            pid = child.id(),
            pty = self.settings.pty,
            "Job process started"
        );

        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut cancelled: Option<CancelRequest> = *cancel_rx.borrow_and_update();
        let mut kill_at: Option<Instant> = None;

        if let Some(request) = cancelled {
            kill_at = Some(start_cancel(&mut child, request));
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(RunnerError::Wait)?,
                changed = cancel_rx.changed(), if cancelled.is_none() => {
                    if changed.is_err() {
                        continue;
                    }
                    let request = *cancel_rx.borrow_and_update();
                    if let Some(request) = request {
                        cancelled = Some(request);
                        kill_at = Some(start_cancel(&mut child, request));
                    }
                }
                _ = sleep_until_deadline(kill_at), if kill_at.is_some() => {
                    warn!(
                        job_id = %self.context.job.id,
                        "Grace period elapsed, killing job process group"
                    );
                    if let Err(e) = signal_process_tree(&mut child, ProcessSignal::Kill) {
                        warn!("{}", e);
                    }
                    kill_at = None;
                }
            }
        };

        // Background processes left behind by the job die with it
        if let Some(group) = group {
            if let Err(e) = signal_process_group(group, ProcessSignal::Kill) {
                warn!("{}", e);
            }
        }
        drain_readers(readers).await;

        let outcome = outcome_from_status(status, cancelled.map(|r| r.reason));
        info!(
            job_id = %self.context.job.id,
            exit_status = outcome.exit_status,
            signal = outcome.signal.as_deref().unwrap_or(""),
            "Job process exited"
        );
        Ok(outcome)
    }

    fn cancel(&self, request: CancelRequest) {
        self.cancel_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(request);
            true
        });
    }
}

/// Send the cancel signal and return when the kill should follow
fn start_cancel(child: &mut Child, request: CancelRequest) -> Instant {
    info!(
        pid = child.id(),
        signal = %request.signal,
        grace_period_ms = request.grace_period.as_millis() as u64,
        reason = %request.reason,
        "Cancelling job process"
    );
    if let Err(e) = signal_process_tree(child, request.signal) {
        warn!("{}", e);
    }
    Instant::now() + request.grace_period
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn spawn_pipe_reader<R>(mut pipe: R, output: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if output.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("output pipe closed: {}", e);
                    break;
                }
            }
        }
    })
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let drain = futures::future::join_all(readers);
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Job output still open after the process exited, detaching");
    }
}

fn outcome_from_status(status: ExitStatus, cancel_reason: Option<SignalReason>) -> JobOutcome {
    if let Some(code) = status.code() {
        return JobOutcome {
            exit_status: code,
            signal: None,
            signal_reason: cancel_reason,
        };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(number) = status.signal() {
            return JobOutcome {
                exit_status: -1,
                signal: Some(super::signal::signal_name(number)),
                signal_reason: Some(cancel_reason.unwrap_or(SignalReason::Signal)),
            };
        }
    }

    JobOutcome {
        exit_status: -1,
        signal: None,
        signal_reason: cancel_reason,
    }
}

/// Make a name safe to use as a single path component
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
