//! Command-line interface definitions
//!
//! Every agent setting can be given as a flag or through its
//! `RAIBID_AGENT_*` environment variable. Both override the config file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use raibid_common::{AgentConfig, PriorityOrder, ProcessSignal};

#[derive(Parser, Debug)]
#[command(name = "raibid")]
#[command(author, version, about = "raibid-ci build agent", long_about = None)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true, env = "RAIBID_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "RAIBID_AGENT_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register agents and run jobs until stopped
    Start(StartArgs),

    /// Inspect the agent configuration
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub settings: AgentSettings,
}

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print the effective configuration with the token redacted
    Show {
        #[command(flatten)]
        settings: AgentSettings,
    },
}

/// Agent settings that override the config file
#[derive(Args, Debug, Default)]
pub struct AgentSettings {
    /// Registration token
    #[arg(long, env = "RAIBID_AGENT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Coordinator API endpoint
    #[arg(long, env = "RAIBID_AGENT_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Agent name template (%hostname, %spawn, %n)
    #[arg(long, env = "RAIBID_AGENT_NAME")]
    pub name: Option<String>,

    /// Priority given to every agent
    #[arg(long, env = "RAIBID_AGENT_PRIORITY")]
    pub priority: Option<i32>,

    /// Agent tags, comma separated
    #[arg(long, env = "RAIBID_AGENT_TAGS", value_delimiter = ',')]
    pub tags: Option<Vec<String>>,

    /// Number of agents to run
    #[arg(long, env = "RAIBID_AGENT_SPAWN")]
    pub spawn: Option<usize>,

    /// Give each spawned agent its own priority
    #[arg(long, env = "RAIBID_AGENT_SPAWN_WITH_PRIORITY", num_args = 0..=1, default_missing_value = "true")]
    pub spawn_with_priority: Option<bool>,

    /// Priority order for spawned agents (ascending, descending)
    #[arg(long, env = "RAIBID_AGENT_PRIORITY_ORDER")]
    pub priority_order: Option<PriorityOrder>,

    /// Signal sent to a job's processes when it is cancelled
    #[arg(long, env = "RAIBID_AGENT_CANCEL_SIGNAL")]
    pub cancel_signal: Option<ProcessSignal>,

    /// Time between the cancel signal and SIGKILL, e.g. 10s
    #[arg(long, env = "RAIBID_AGENT_CANCEL_GRACE_PERIOD", value_parser = humantime::parse_duration)]
    pub cancel_grace_period: Option<Duration>,

    /// Disconnect after running one job
    #[arg(long, env = "RAIBID_AGENT_DISCONNECT_AFTER_JOB", num_args = 0..=1, default_missing_value = "true")]
    pub disconnect_after_job: Option<bool>,

    /// Disconnect once the pool has been idle this long, e.g. 10m
    #[arg(long, env = "RAIBID_AGENT_DISCONNECT_AFTER_IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    pub disconnect_after_idle_timeout: Option<Duration>,

    /// Directory for job working directories
    #[arg(long, env = "RAIBID_AGENT_BUILD_PATH")]
    pub build_path: Option<PathBuf>,

    /// Shell used to run job scripts
    #[arg(long, env = "RAIBID_AGENT_SHELL")]
    pub shell: Option<String>,

    /// Run jobs with plain pipes instead of a pseudo-terminal
    #[arg(long, env = "RAIBID_AGENT_NO_PTY", num_args = 0..=1, default_missing_value = "true")]
    pub no_pty: Option<bool>,

    /// Serve /status and /healthz on this address
    #[arg(long, env = "RAIBID_AGENT_HEALTH_CHECK_ADDR")]
    pub health_check_addr: Option<String>,

    /// Randomize the first ping
    #[arg(long, env = "RAIBID_AGENT_PING_JITTER", num_args = 0..=1, default_missing_value = "true")]
    pub ping_jitter: Option<bool>,
}

impl AgentSettings {
    /// Overlay the settings that were given onto `config`
    pub fn apply(self, config: &mut AgentConfig) {
        if self.token.is_some() {
            config.token = self.token;
        }
        if self.priority.is_some() {
            config.priority = self.priority;
        }
        if self.health_check_addr.is_some() {
            config.health_check_addr = self.health_check_addr;
        }

        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(tags) = self.tags {
            config.tags = tags;
        }
        if let Some(spawn) = self.spawn {
            config.spawn = spawn;
        }
        if let Some(enabled) = self.spawn_with_priority {
            config.spawn_with_priority = enabled;
        }
        if let Some(order) = self.priority_order {
            config.priority_order = order;
        }
        if let Some(signal) = self.cancel_signal {
            config.cancel_signal = signal;
        }
        if let Some(grace) = self.cancel_grace_period {
            config.cancel_grace_period = grace;
        }
        if let Some(enabled) = self.disconnect_after_job {
            config.disconnect_after_job = enabled;
        }
        if let Some(timeout) = self.disconnect_after_idle_timeout {
            config.disconnect_after_idle_timeout = timeout;
        }
        if let Some(path) = self.build_path {
            config.build_path = path;
        }
        if let Some(shell) = self.shell {
            config.shell = shell;
        }
        if let Some(no_pty) = self.no_pty {
            config.no_pty = no_pty;
        }
        if let Some(enabled) = self.ping_jitter {
            config.ping_jitter = enabled;
        }
    }
}
