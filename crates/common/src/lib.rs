//! raibid-common
//!
//! Shared building blocks for the raibid build agent:
//! - Agent identity and job wire types exchanged with the coordinator
//! - The [`Coordinator`] trait and its HTTP implementation ([`ApiClient`])
//! - Status-code classification for retry decisions
//! - Process signal names used for job cancellation
//! - The YAML configuration file layer

pub mod api_client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod signal;
pub mod types;

// Re-export commonly used types
pub use api_client::{ApiClient, ApiConfig};
pub use config::{AgentConfig, PriorityOrder};
pub use coordinator::Coordinator;
pub use error::{ApiError, ConfigError};
pub use reqwest::StatusCode;
pub use signal::ProcessSignal;
pub use types::{
    AccessToken, AgentIdentity, JobAssignment, JobState, JobStatusReport, LogChunk, PingAction,
    PingResponse, RegisterRequest, SignalReason,
};
