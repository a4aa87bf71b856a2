//! HTTP client for the build coordinator
//!
//! This module provides the reqwest-backed [`Coordinator`] implementation
//! used by the agent binary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::types::{
    AgentIdentity, JobAssignment, JobState, JobStatusReport, LogChunk, PingResponse,
    RegisterRequest,
};

/// API client configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the coordinator API, e.g. `https://ci.example.com/v3`
    pub endpoint: String,
    /// Registration token, only used for `register`
    pub registration_token: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(endpoint: impl Into<String>, registration_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            registration_token: registration_token.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// API client for the coordinator
#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct JobStateResponse {
    state: JobState,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!("{} {}", method, url);

        self.client
            .request(method, url)
            .header(USER_AGENT, concat!("raibid-agent/", env!("CARGO_PKG_VERSION")))
            .header(AUTHORIZATION, format!("Token {}", token))
    }

    fn agent_request(&self, method: Method, path: &str, agent: &AgentIdentity) -> RequestBuilder {
        self.request(method, path, agent.access_token.expose())
    }

    /// Turn a non-success response into an [`ApiError::Status`]
    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(ApiError::status(status, message))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let response = Self::check(response).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Coordinator for ApiClient {
    async fn register(&self, request: &RegisterRequest) -> Result<AgentIdentity, ApiError> {
        let response = self
            .request(Method::POST, "register", &self.config.registration_token)
            .json(request)
            .send()
            .await?;

        Self::json(response).await
    }

    async fn connect(&self, agent: &AgentIdentity) -> Result<(), ApiError> {
        let response = self
            .agent_request(Method::POST, "connect", agent)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn heartbeat(&self, agent: &AgentIdentity) -> Result<(), ApiError> {
        let response = self
            .agent_request(Method::POST, "heartbeat", agent)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn ping(&self, agent: &AgentIdentity) -> Result<PingResponse, ApiError> {
        let response = self.agent_request(Method::GET, "ping", agent).send().await?;
        Self::json(response).await
    }

    async fn accept_job(
        &self,
        agent: &AgentIdentity,
        job_id: &str,
    ) -> Result<JobAssignment, ApiError> {
        let path = format!("jobs/{}/accept", job_id);
        let response = self.agent_request(Method::PUT, &path, agent).send().await?;
        Self::json(response).await
    }

    async fn report_job_status(
        &self,
        agent: &AgentIdentity,
        job_id: &str,
        status: &JobStatusReport,
    ) -> Result<(), ApiError> {
        let path = format!("jobs/{}/{}", job_id, status.kind());
        let response = self
            .agent_request(Method::PUT, &path, agent)
            .json(status)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn job_state(&self, agent: &AgentIdentity, job_id: &str) -> Result<JobState, ApiError> {
        let path = format!("jobs/{}", job_id);
        let response = self.agent_request(Method::GET, &path, agent).send().await?;
        let body: JobStateResponse = Self::json(response).await?;
        Ok(body.state)
    }

    async fn upload_chunk(
        &self,
        agent: &AgentIdentity,
        job_id: &str,
        chunk: &LogChunk,
    ) -> Result<(), ApiError> {
        let path = format!("jobs/{}/chunks", job_id);
        let response = self
            .agent_request(Method::POST, &path, agent)
            .query(&[
                ("sequence", chunk.sequence),
                ("offset", chunk.offset),
                ("size", chunk.size() as u64),
            ])
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(chunk.data.clone())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn disconnect(&self, agent: &AgentIdentity) -> Result<(), ApiError> {
        let response = self
            .agent_request(Method::POST, "disconnect", agent)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
