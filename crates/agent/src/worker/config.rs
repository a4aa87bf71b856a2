//! Per-worker settings

use std::time::Duration;

use raibid_common::{AgentConfig, ProcessSignal, RegisterRequest};

use crate::retry::RetryPolicy;

/// Retry policy of each coordinator call a worker makes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub register: RetryPolicy,
    pub connect: RetryPolicy,
    pub ping: RetryPolicy,
    pub heartbeat: RetryPolicy,
    pub accept: RetryPolicy,
    pub report: RetryPolicy,
    pub upload: RetryPolicy,
    pub disconnect: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            register: RetryPolicy::constant(Duration::from_secs(10), 30).with_jitter(0.1),
            connect: RetryPolicy::constant(Duration::from_secs(5), 10).with_jitter(0.1),
            ping: RetryPolicy::exponential(Duration::from_secs(1), 5)
                .with_max_interval(Duration::from_secs(30))
                .with_jitter(0.1),
            heartbeat: RetryPolicy::constant(Duration::from_secs(5), 3),
            accept: RetryPolicy::exponential(Duration::from_secs(1), 5)
                .with_max_interval(Duration::from_secs(10)),
            report: RetryPolicy::exponential(Duration::from_secs(1), 10)
                .with_max_interval(Duration::from_secs(30))
                .with_jitter(0.1),
            upload: RetryPolicy::exponential(Duration::from_millis(500), 5)
                .with_max_interval(Duration::from_secs(10)),
            disconnect: RetryPolicy::constant(Duration::from_secs(1), 4),
        }
    }
}

impl RetryPolicies {
    /// The same policy for every call
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            register: policy.clone(),
            connect: policy.clone(),
            ping: policy.clone(),
            heartbeat: policy.clone(),
            accept: policy.clone(),
            report: policy.clone(),
            upload: policy.clone(),
            disconnect: policy,
        }
    }
}

/// Settings of one agent worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 1-based spawn index
    pub index: usize,
    pub registration: RegisterRequest,
    pub cancel_signal: ProcessSignal,
    pub cancel_grace_period: Duration,
    /// Disconnect once a job has finished
    pub disconnect_after_job: bool,
    /// Disconnect after this long without work while the pool is idle (zero disables)
    pub disconnect_after_idle_timeout: Duration,
    /// Delay the first ping by a random part of the ping interval
    pub ping_jitter: bool,
    pub retry: RetryPolicies,
}

impl WorkerConfig {
    pub fn new(index: usize, registration: RegisterRequest) -> Self {
        Self {
            index,
            registration,
            cancel_signal: ProcessSignal::Term,
            cancel_grace_period: Duration::from_secs(10),
            disconnect_after_job: false,
            disconnect_after_idle_timeout: Duration::ZERO,
            ping_jitter: true,
            retry: RetryPolicies::default(),
        }
    }

    /// Worker settings taken from the agent configuration
    pub fn from_agent_config(
        config: &AgentConfig,
        index: usize,
        registration: RegisterRequest,
    ) -> Self {
        Self {
            cancel_signal: config.cancel_signal,
            cancel_grace_period: config.cancel_grace_period,
            disconnect_after_job: config.disconnect_after_job,
            disconnect_after_idle_timeout: config.disconnect_after_idle_timeout,
            ping_jitter: config.ping_jitter,
            ..Self::new(index, registration)
        }
    }

    pub fn with_cancel(mut self, signal: ProcessSignal, grace_period: Duration) -> Self {
        self.cancel_signal = signal;
        self.cancel_grace_period = grace_period;
        self
    }

    pub fn with_disconnect_after_job(mut self, enabled: bool) -> Self {
        self.disconnect_after_job = enabled;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_after_idle_timeout = timeout;
        self
    }

    pub fn with_ping_jitter(mut self, enabled: bool) -> Self {
        self.ping_jitter = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicies) -> Self {
        self.retry = retry;
        self
    }
}
