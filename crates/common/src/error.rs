//! Error types shared across the agent crates

use reqwest::StatusCode;
use thiserror::Error;

/// Status codes the coordinator uses to reject a request outright.
///
/// Retrying a request that failed with one of these never helps.
pub const TERMINAL_STATUS_CODES: [u16; 5] = [400, 401, 404, 410, 422];

/// Error returned by coordinator API calls
#[derive(Debug, Error)]
pub enum ApiError {
    /// The coordinator answered with a non-success status
    #[error("coordinator returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    /// The request never produced a response (connect error, timeout, ...)
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body could not be decoded
    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Build a status error from a code and response body
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if the coordinator responded at all
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status(),
            Self::Decode(_) => None,
        }
    }

    /// Whether the coordinator rejected the request in a way retries cannot fix
    pub fn is_terminal(&self) -> bool {
        self.status_code()
            .map(|s| TERMINAL_STATUS_CODES.contains(&s.as_u16()))
            .unwrap_or(false)
    }
}

/// Configuration errors, detected before any worker is spawned
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown signal name: {0}")]
    UnknownSignal(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
