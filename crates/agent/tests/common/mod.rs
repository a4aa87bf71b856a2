//! Common test utilities for raibid-agent integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use raibid_agent::{
    CancelRequest, JobContext, JobOutcome, JobRunner, OutputSink, RetryPolicies, RetryPolicy,
    RunnerError, RunnerFactory, WorkerConfig,
};
use raibid_common::{
    AccessToken, AgentIdentity, ApiError, Coordinator, JobAssignment, JobState, JobStatusReport,
    LogChunk, PingAction, PingResponse, RegisterRequest, StatusCode,
};
use tokio::sync::watch;
use tokio::time::Instant;

static INIT: Once = Once::new();

/// Initialize tracing for tests, once per test binary
pub fn init_test_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_filter = EnvFilter::new("warn")
            .add_directive("tower_http::trace=off".parse().unwrap())
            .add_directive("raibid_agent=info".parse().unwrap());

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

pub fn register_request(name: &str) -> RegisterRequest {
    RegisterRequest {
        name: name.to_string(),
        hostname: "test-host".to_string(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        version: "0.0.0".to_string(),
        priority: None,
        tags: vec![],
        features: vec![],
    }
}

/// Worker settings with quick retries and no ping jitter
pub fn worker_config(name: &str) -> WorkerConfig {
    WorkerConfig::new(1, register_request(name))
        .with_ping_jitter(false)
        .with_retry(RetryPolicies::uniform(RetryPolicy::constant(
            Duration::from_millis(10),
            3,
        )))
}

pub fn job(id: &str, command: &str) -> JobAssignment {
    JobAssignment {
        id: id.to_string(),
        command: command.to_string(),
        env: Default::default(),
        metadata: Default::default(),
    }
}

pub fn offer(id: &str) -> Reply {
    Ok(PingResponse::with_job(job(id, "echo hello")))
}

pub fn disconnect_action() -> Reply {
    Ok(PingResponse {
        action: PingAction::Disconnect,
        job: None,
    })
}

pub fn pause_action() -> Reply {
    Ok(PingResponse {
        action: PingAction::Pause,
        job: None,
    })
}

/// A scripted ping reply; errors are given as status codes
pub type Reply = Result<PingResponse, StatusCode>;

/// In-memory coordinator with scripted replies and call records
pub struct FakeCoordinator {
    ping_interval: u64,
    job_status_interval: u64,
    pings: Mutex<HashMap<String, VecDeque<Reply>>>,
    register_failures: Mutex<HashMap<String, StatusCode>>,
    accept_failure: Mutex<Option<StatusCode>>,
    upload_failure: Mutex<Option<StatusCode>>,
    job_states: Mutex<HashMap<String, JobState>>,
    pub calls: Calls,
    pub reports: Mutex<Vec<(String, JobStatusReport, Instant)>>,
    pub chunks: Mutex<Vec<LogChunk>>,
    pub disconnects: Mutex<Vec<(String, Instant)>>,
    pub ping_times: Mutex<Vec<Instant>>,
}

#[derive(Default)]
pub struct Calls {
    pub register: AtomicUsize,
    pub connect: AtomicUsize,
    pub heartbeat: AtomicUsize,
    pub ping: AtomicUsize,
    pub accept: AtomicUsize,
    pub job_state: AtomicUsize,
    pub upload: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Default for FakeCoordinator {
    fn default() -> Self {
        Self {
            ping_interval: 1,
            job_status_interval: 1,
            pings: Mutex::new(HashMap::new()),
            register_failures: Mutex::new(HashMap::new()),
            accept_failure: Mutex::new(None),
            upload_failure: Mutex::new(None),
            job_states: Mutex::new(HashMap::new()),
            calls: Calls::default(),
            reports: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            ping_times: Mutex::new(Vec::new()),
        }
    }
}

impl FakeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies for the agent called `name`; once used up it is told to idle
    pub fn script_pings(&self, name: &str, replies: Vec<Reply>) {
        self.pings.lock().insert(name.to_string(), replies.into());
    }

    pub fn fail_register(&self, name: &str, status: StatusCode) {
        self.register_failures.lock().insert(name.to_string(), status);
    }

    pub fn fail_accept(&self, status: StatusCode) {
        *self.accept_failure.lock() = Some(status);
    }

    pub fn fail_uploads(&self, status: StatusCode) {
        *self.upload_failure.lock() = Some(status);
    }

    pub fn set_job_state(&self, job_id: &str, state: JobState) {
        self.job_states.lock().insert(job_id.to_string(), state);
    }

    pub fn identity(&self, name: &str) -> AgentIdentity {
        AgentIdentity {
            id: format!("id-{}", name),
            name: name.to_string(),
            access_token: AccessToken::new(format!("token-{}", name)),
            priority: None,
            tags: vec![],
            features: vec![],
            ping_interval: self.ping_interval,
            heartbeat_interval: 60,
            job_status_interval: self.job_status_interval,
        }
    }

    /// Status report kinds for `job_id`, in order
    pub fn report_kinds(&self, job_id: &str) -> Vec<&'static str> {
        self.reports
            .lock()
            .iter()
            .filter(|(id, _, _)| id == job_id)
            .map(|(_, report, _)| report.kind())
            .collect()
    }

    pub fn finish_report(&self, job_id: &str) -> Option<(JobStatusReport, Instant)> {
        self.reports
            .lock()
            .iter()
            .find(|(id, report, _)| id == job_id && report.kind() == "finish")
            .map(|(_, report, at)| (report.clone(), *at))
    }

    pub fn uploaded_output(&self) -> String {
        let bytes: Vec<u8> = self
            .chunks
            .lock()
            .iter()
            .flat_map(|chunk| chunk.data.clone())
            .collect();
        String::from_utf8_lossy(&bytes).to_string()
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn register(&self, request: &RegisterRequest) -> Result<AgentIdentity, ApiError> {
        self.calls.register.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.register_failures.lock().get(&request.name) {
            return Err(ApiError::status(*status, "registration refused"));
        }
        Ok(self.identity(&request.name))
    }

    async fn connect(&self, _agent: &AgentIdentity) -> Result<(), ApiError> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn heartbeat(&self, _agent: &AgentIdentity) -> Result<(), ApiError> {
        self.calls.heartbeat.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, agent: &AgentIdentity) -> Result<PingResponse, ApiError> {
        self.calls.ping.fetch_add(1, Ordering::SeqCst);
        self.ping_times.lock().push(Instant::now());
        let reply = self
            .pings
            .lock()
            .get_mut(&agent.name)
            .and_then(VecDeque::pop_front);

        match reply {
            Some(Ok(response)) => Ok(response),
            Some(Err(status)) => Err(ApiError::status(status, "ping failed")),
            None => Ok(PingResponse::idle()),
        }
    }

    async fn accept_job(
        &self,
        _agent: &AgentIdentity,
        job_id: &str,
    ) -> Result<JobAssignment, ApiError> {
        self.calls.accept.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.accept_failure.lock() {
            return Err(ApiError::status(status, "job not available"));
        }
        Ok(job(job_id, "echo hello"))
    }

    async fn report_job_status(
        &self,
        _agent: &AgentIdentity,
        job_id: &str,
        status: &JobStatusReport,
    ) -> Result<(), ApiError> {
        self.reports
            .lock()
            .push((job_id.to_string(), status.clone(), Instant::now()));
        Ok(())
    }

    async fn job_state(&self, _agent: &AgentIdentity, job_id: &str) -> Result<JobState, ApiError> {
        self.calls.job_state.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .job_states
            .lock()
            .get(job_id)
            .copied()
            .unwrap_or(JobState::Running))
    }

    async fn upload_chunk(
        &self,
        _agent: &AgentIdentity,
        _job_id: &str,
        chunk: &LogChunk,
    ) -> Result<(), ApiError> {
        self.calls.upload.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.upload_failure.lock() {
            return Err(ApiError::status(status, "upload failed"));
        }
        self.chunks.lock().push(chunk.clone());
        Ok(())
    }

    async fn disconnect(&self, agent: &AgentIdentity) -> Result<(), ApiError> {
        self.disconnects
            .lock()
            .push((agent.name.clone(), Instant::now()));
        Ok(())
    }
}

/// How a fake job behaves
#[derive(Debug, Clone, Copy)]
pub struct FakeJob {
    pub duration: Duration,
    pub exit_code: i32,
    /// Keep running after the cancel signal until the grace period ends
    pub ignores_signal: bool,
}

impl Default for FakeJob {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(2),
            exit_code: 0,
            ignores_signal: false,
        }
    }
}

impl FakeJob {
    pub fn lasting(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }
}

/// What every fake runner of a factory did
#[derive(Default)]
pub struct RunnerLog {
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub runs: AtomicUsize,
    pub started: Mutex<Vec<(String, Instant)>>,
    pub cancels: Mutex<Vec<(CancelRequest, Instant)>>,
    pub kills: Mutex<Vec<Instant>>,
}

impl RunnerLog {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Runner that simulates a job with timers instead of a process
pub struct FakeRunner {
    job_id: String,
    behavior: FakeJob,
    output: Mutex<Option<OutputSink>>,
    cancel_tx: watch::Sender<Option<CancelRequest>>,
    log: Arc<RunnerLog>,
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn run(&self) -> Result<JobOutcome, RunnerError> {
        let active = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_active.fetch_max(active, Ordering::SeqCst);
        self.log.runs.fetch_add(1, Ordering::SeqCst);
        self.log
            .started
            .lock()
            .push((self.job_id.clone(), Instant::now()));

        let output = self.output.lock().take();
        if let Some(output) = output {
            let _ = output.send(b"hello\n".to_vec()).await;
        }

        let mut cancel_rx = self.cancel_tx.subscribe();
        let cancelled = async {
            match cancel_rx.wait_for(Option::is_some).await {
                Ok(request) => *request,
                Err(_) => None,
            }
        };
        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.behavior.duration) => JobOutcome::exited(self.behavior.exit_code),
            request = cancelled => match request {
                Some(request) => self.on_cancel(request).await,
                None => JobOutcome::run_error(),
            },
        };

        self.log.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }

    fn cancel(&self, request: CancelRequest) {
        self.cancel_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            self.log.cancels.lock().push((request, Instant::now()));
            *current = Some(request);
            true
        });
    }
}

impl FakeRunner {
    async fn on_cancel(&self, request: CancelRequest) -> JobOutcome {
        if !self.behavior.ignores_signal {
            return JobOutcome {
                exit_status: -1,
                signal: Some(request.signal.as_str().to_string()),
                signal_reason: Some(request.reason),
            };
        }

        tokio::time::sleep(request.grace_period).await;
        self.log.kills.lock().push(Instant::now());
        JobOutcome {
            exit_status: -1,
            signal: Some("SIGKILL".to_string()),
            signal_reason: Some(request.reason),
        }
    }
}

/// Hands out fake runners, one scripted behavior per job
#[derive(Default)]
pub struct FakeRunnerFactory {
    jobs: Mutex<VecDeque<FakeJob>>,
    default_job: FakeJob,
    fail_create: bool,
    panic_on_create: bool,
    pub log: Arc<RunnerLog>,
}

impl FakeRunnerFactory {
    pub fn new(default_job: FakeJob) -> Arc<Self> {
        Arc::new(Self {
            default_job,
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            ..Default::default()
        })
    }

    /// A factory whose `create` panics
    pub fn panicking() -> Arc<Self> {
        Arc::new(Self {
            panic_on_create: true,
            ..Default::default()
        })
    }

    pub fn push_job(&self, job: FakeJob) {
        self.jobs.lock().push_back(job);
    }
}

impl RunnerFactory for FakeRunnerFactory {
    fn create(
        &self,
        context: JobContext,
        output: OutputSink,
    ) -> Result<Arc<dyn JobRunner>, RunnerError> {
        if self.fail_create {
            return Err(RunnerError::EmptyShell);
        }
        if self.panic_on_create {
            panic!("runner factory blew up");
        }

        let behavior = self.jobs.lock().pop_front().unwrap_or(self.default_job);
        let (cancel_tx, _) = watch::channel(None);
        Ok(Arc::new(FakeRunner {
            job_id: context.job.id,
            behavior,
            output: Mutex::new(Some(output)),
            cancel_tx,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Poll `condition` every 50ms until it holds or 120s pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(120);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
