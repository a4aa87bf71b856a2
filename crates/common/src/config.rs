//! Agent configuration file
//!
//! The agent reads an optional YAML file. Command-line flags and their
//! `RAIBID_AGENT_*` environment variables are applied on top by the CLI, so
//! the effective precedence is flag > env > file > default.
//!
//! ```yaml
//! token: "xxxx"
//! endpoint: https://ci.example.com/v3
//! name: "%hostname-%spawn"
//! spawn: 4
//! tags: [queue=linux, docker=true]
//! cancel_signal: SIGINT
//! cancel_grace_period: 30s
//! disconnect_after_idle_timeout: 10m
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::signal::ProcessSignal;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RAIBID_AGENT_CONFIG";

/// Order in which priorities are handed out to spawned agents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityOrder {
    /// First spawned agent gets priority 1, the next 2, ...
    #[default]
    Ascending,
    /// First spawned agent gets the highest priority
    Descending,
}

impl std::str::FromStr for PriorityOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascending" => Ok(Self::Ascending),
            "descending" => Ok(Self::Descending),
            other => Err(ConfigError::Invalid {
                field: "priority_order",
                reason: format!("expected ascending or descending, got {}", other),
            }),
        }
    }
}

/// Effective agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Registration token
    pub token: Option<String>,
    /// Coordinator API endpoint
    pub endpoint: String,
    /// Agent name template (`%hostname`, `%spawn`, `%n`)
    pub name: String,
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    /// Number of agents to run in this process
    pub spawn: usize,
    /// Give each spawned agent its own priority
    pub spawn_with_priority: bool,
    pub priority_order: PriorityOrder,
    /// Signal sent to a job's processes on cancellation
    pub cancel_signal: ProcessSignal,
    /// Time between the cancel signal and SIGKILL
    #[serde(with = "humantime_serde")]
    pub cancel_grace_period: Duration,
    /// Disconnect after running a single job
    pub disconnect_after_job: bool,
    /// Disconnect after the whole pool has been idle this long (0 = never)
    #[serde(with = "humantime_serde")]
    pub disconnect_after_idle_timeout: Duration,
    /// Directory that job working directories are created under
    pub build_path: PathBuf,
    /// Shell command used to run job scripts
    pub shell: String,
    /// Run jobs with plain pipes instead of a pseudo-terminal
    pub no_pty: bool,
    /// Address for the status server, e.g. `127.0.0.1:3901`
    pub health_check_addr: Option<String>,
    /// Randomize the first ping to spread load
    pub ping_jitter: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: None,
            endpoint: "http://localhost:8080/v3".to_string(),
            name: "%hostname-%spawn".to_string(),
            priority: None,
            tags: Vec::new(),
            spawn: 1,
            spawn_with_priority: false,
            priority_order: PriorityOrder::default(),
            cancel_signal: ProcessSignal::Term,
            cancel_grace_period: Duration::from_secs(10),
            disconnect_after_job: false,
            disconnect_after_idle_timeout: Duration::ZERO,
            build_path: default_build_path(),
            shell: "/bin/sh -c".to_string(),
            no_pty: false,
            health_check_addr: None,
            ping_jitter: true,
        }
    }
}

fn default_build_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("raibid").join("builds"))
        .unwrap_or_else(|| PathBuf::from("builds"))
}

impl AgentConfig {
    /// Default config file location: `<config_dir>/raibid/agent.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("raibid").join("agent.yaml"))
    }

    /// Load configuration
    ///
    /// An explicit path must exist. Without one, `RAIBID_AGENT_CONFIG` is
    /// consulted, then the default location; a missing default file yields
    /// the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let mut config: Self =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        config.expand_paths();

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Expand `~` and environment variables in path settings
    pub fn expand_paths(&mut self) {
        let raw = self.build_path.to_string_lossy().to_string();
        if let Ok(expanded) = shellexpand::full(&raw) {
            self.build_path = PathBuf::from(expanded.as_ref());
        }
    }

    /// Check that the configuration can start an agent
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => return Err(ConfigError::Missing("token")),
        }

        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint"));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("{} is not an http(s) URL", self.endpoint),
            });
        }

        if self.spawn == 0 {
            return Err(ConfigError::Invalid {
                field: "spawn",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.shell.split_whitespace().next().is_none() {
            return Err(ConfigError::Missing("shell"));
        }

        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing("name"));
        }

        Ok(())
    }

    /// Copy with the token masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.token.is_some() {
            copy.token = Some("***".to_string());
        }
        copy
    }
}

// Duration <-> humantime string ("10s", "5m")
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.trim() == "0" {
            return Ok(Duration::ZERO);
        }
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
