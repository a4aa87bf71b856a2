//! Coordinator API boundary
//!
//! Everything the agent needs from the remote coordinator. The agent core
//! only talks to this trait; [`crate::ApiClient`] is the HTTP implementation
//! and tests substitute in-memory fakes.
//!
//! Calls made on behalf of a registered agent take its [`AgentIdentity`],
//! so the access token stays owned by the worker that registered it.

use async_trait::async_trait;

use crate::error::ApiError;
use crate::types::{
    AgentIdentity, JobAssignment, JobState, JobStatusReport, LogChunk, PingResponse,
    RegisterRequest,
};

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Register a new agent, returning its identity and access token
    async fn register(&self, request: &RegisterRequest) -> Result<AgentIdentity, ApiError>;

    /// Mark the agent as connected
    async fn connect(&self, agent: &AgentIdentity) -> Result<(), ApiError>;

    /// Tell the coordinator the agent is still alive
    async fn heartbeat(&self, agent: &AgentIdentity) -> Result<(), ApiError>;

    /// Ask for work
    async fn ping(&self, agent: &AgentIdentity) -> Result<PingResponse, ApiError>;

    /// Claim a job offered by a ping
    async fn accept_job(
        &self,
        agent: &AgentIdentity,
        job_id: &str,
    ) -> Result<JobAssignment, ApiError>;

    /// Report a job status transition
    async fn report_job_status(
        &self,
        agent: &AgentIdentity,
        job_id: &str,
        status: &JobStatusReport,
    ) -> Result<(), ApiError>;

    /// Current state of a job, used to notice remote cancellation
    async fn job_state(&self, agent: &AgentIdentity, job_id: &str) -> Result<JobState, ApiError>;

    /// Upload a chunk of job output
    async fn upload_chunk(
        &self,
        agent: &AgentIdentity,
        job_id: &str,
        chunk: &LogChunk,
    ) -> Result<(), ApiError>;

    /// Mark the agent as disconnected
    async fn disconnect(&self, agent: &AgentIdentity) -> Result<(), ApiError>;
}
