//! Agent registration
//!
//! Turns the configured name template and priority policy into one
//! [`RegisterRequest`] per spawned worker, and registers it with retries.

use raibid_common::{
    AgentConfig, AgentIdentity, ApiError, Coordinator, PriorityOrder, RegisterRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::retry::{break_if_terminal, Retrier, RetryError, RetryPolicy};

/// How priorities are handed out to spawned agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicy {
    /// Every agent gets the configured priority
    Fixed(Option<i32>),
    /// Agent `n` gets priority `n`
    Ascending,
    /// Agent `n` gets priority `spawn - n + 1`, so the first agent ranks highest
    Descending,
}

impl PriorityPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        if !config.spawn_with_priority {
            return Self::Fixed(config.priority);
        }
        match config.priority_order {
            PriorityOrder::Ascending => Self::Ascending,
            PriorityOrder::Descending => Self::Descending,
        }
    }

    /// Priority for the 1-based spawn `index` out of `spawn` agents
    pub fn priority_for(&self, index: usize, spawn: usize) -> Option<i32> {
        match *self {
            Self::Fixed(priority) => priority,
            Self::Ascending => Some(index as i32),
            Self::Descending => Some(spawn.saturating_sub(index) as i32 + 1),
        }
    }
}

/// Expand `%hostname`, `%spawn` and `%n` in an agent name template
///
/// With several agents and no `%spawn` in the template, every agent after
/// the first gets a `-<index>` suffix so names stay unique.
pub fn expand_name(template: &str, hostname: &str, index: usize, spawn: usize) -> String {
    let index_str = index.to_string();
    let mut name = template
        .replace("%hostname", hostname)
        .replace("%spawn", &index_str)
        .replace("%n", &index_str);

    if spawn > 1 && !template.contains("%spawn") && !template.contains("%n") && index > 1 {
        name.push('-');
        name.push_str(&index_str);
    }
    name
}

/// Capabilities advertised when registering
pub fn supported_features(pty: bool) -> Vec<String> {
    let mut features = vec!["variables", "cancelable", "log_chunks", "signal_reason"];
    if pty {
        features.push("pty");
    }
    features.into_iter().map(str::to_string).collect()
}

/// Name of this machine
pub fn hostname() -> String {
    #[cfg(unix)]
    if let Ok(name) = nix::unistd::gethostname() {
        if let Some(name) = name.to_str() {
            return name.to_string();
        }
    }

    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Everything needed to build the registration request of each spawned agent
#[derive(Debug, Clone)]
pub struct Registration {
    pub name_template: String,
    pub hostname: String,
    pub tags: Vec<String>,
    pub features: Vec<String>,
    pub priority: PriorityPolicy,
    pub spawn: usize,
}

impl Registration {
    pub fn from_config(config: &AgentConfig, features: Vec<String>) -> Self {
        Self {
            name_template: config.name.clone(),
            hostname: hostname(),
            tags: config.tags.clone(),
            features,
            priority: PriorityPolicy::from_config(config),
            spawn: config.spawn.max(1),
        }
    }

    /// Request for the 1-based spawn `index`
    pub fn request_for(&self, index: usize) -> RegisterRequest {
        RegisterRequest {
            name: expand_name(&self.name_template, &self.hostname, index, self.spawn),
            hostname: self.hostname.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            priority: self.priority.priority_for(index, self.spawn),
            tags: self.tags.clone(),
            features: self.features.clone(),
        }
    }
}

/// Register an agent, retrying transient failures
///
/// A rejection such as a bad token (401) or invalid request (422) is not
/// retried.
pub async fn register(
    coordinator: &dyn Coordinator,
    request: &RegisterRequest,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<AgentIdentity, RetryError<ApiError>> {
    info!(name = %request.name, priority = ?request.priority, "Registering agent");

    let identity = Retrier::new("register", policy)
        .run_with_cancel(cancel, |attempt| async move {
            coordinator
                .register(request)
                .await
                .map_err(|e| break_if_terminal(&attempt, e))
        })
        .await?;

    info!(
        agent = %identity.name,
        id = %identity.id,
        ping_interval = identity.ping_interval,
        "Agent registered"
    );
    Ok(identity)
}
