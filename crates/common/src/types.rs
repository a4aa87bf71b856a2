//! Wire types exchanged with the coordinator

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-agent credential returned at registration
///
/// `Debug` and `Display` never print the value. The only way to read it is
/// [`AccessToken::expose`], which the HTTP client calls when building the
/// `Authorization` header.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Registration payload describing this agent
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    pub features: Vec<String>,
}

fn default_ping_interval() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_job_status_interval() -> u64 {
    5
}

/// A registered connection to the coordinator
///
/// Created once at registration and never modified afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub access_token: AccessToken,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Seconds between pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Seconds between job state checks while running
    #[serde(default = "default_job_status_interval")]
    pub job_status_interval: u64,
}

impl AgentIdentity {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn job_status_interval(&self) -> Duration {
        Duration::from_secs(self.job_status_interval.max(1))
    }
}

/// Work assigned by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub id: String,
    /// Script handed to the configured shell
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Instruction attached to a ping response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingAction {
    #[default]
    Idle,
    Pause,
    Disconnect,
}

/// Result of a ping: an instruction and possibly a job to accept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub action: PingAction,
    #[serde(default)]
    pub job: Option<JobAssignment>,
}

impl PingResponse {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn with_job(job: JobAssignment) -> Self {
        Self {
            action: PingAction::Idle,
            job: Some(job),
        }
    }
}

/// Job state as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Accepted,
    Running,
    Canceling,
    Canceled,
    Finished,
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// Whether the coordinator wants the job stopped
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceling | Self::Canceled)
    }
}

/// Why a job's process was signalled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    /// The agent was stopped while the job was running
    AgentStop,
    /// The coordinator cancelled the job
    Cancel,
    /// The process could not be started
    ProcessRunError,
    /// The process died of a signal nobody sent on purpose
    Signal,
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentStop => "agent_stop",
            Self::Cancel => "cancel",
            Self::ProcessRunError => "process_run_error",
            Self::Signal => "signal",
        };
        f.write_str(s)
    }
}

/// Job status transition reported to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatusReport {
    Started {
        started_at: DateTime<Utc>,
    },
    Finished {
        exit_status: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal_reason: Option<SignalReason>,
        chunks_failed_count: u64,
        finished_at: DateTime<Utc>,
    },
}

impl JobStatusReport {
    pub fn started() -> Self {
        Self::Started {
            started_at: Utc::now(),
        }
    }

    /// Short name used in log lines and endpoint paths
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "start",
            Self::Finished { .. } => "finish",
        }
    }
}

/// A slice of job output uploaded to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub sequence: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl LogChunk {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
