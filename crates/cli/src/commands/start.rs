//! Start command implementation
//!
//! Builds one worker per spawned agent, wires process signals to the pool
//! and runs it until every worker has disconnected.

use std::sync::Arc;

use anyhow::{Context, Result};
use raibid_agent::registration::supported_features;
use raibid_agent::{
    signals, AgentPool, AgentWorker, ProcessRunnerFactory, ProcessSettings, Registration,
    RunnerFactory, StatusServer, WorkerConfig,
};
use raibid_common::{AgentConfig, ApiClient, ApiConfig, Coordinator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Execute the start command
pub async fn execute(config: AgentConfig) -> Result<()> {
    config.validate().context("Invalid agent configuration")?;

    let token = config.token.clone().unwrap_or_default();
    let api = ApiClient::new(ApiConfig::new(&config.endpoint, token))
        .context("Failed to create coordinator client")?;
    let coordinator: Arc<dyn Coordinator> = Arc::new(api);

    let pty = cfg!(unix) && !config.no_pty;
    let runners: Arc<dyn RunnerFactory> = Arc::new(ProcessRunnerFactory::new(
        ProcessSettings::new(&config.build_path, &config.shell, pty),
    ));

    let pool = Arc::new(build_pool(&config, coordinator, runners, pty));

    let signals = signals::start(pool.clone()).context("Failed to install signal handlers")?;

    let shutdown = CancellationToken::new();
    let status_task = match config.health_check_addr.as_deref() {
        Some(addr) => {
            let server = StatusServer::bind(addr)
                .await
                .with_context(|| format!("Failed to bind status server on {}", addr))?;
            Some(tokio::spawn(server.serve(pool.clone(), shutdown.clone())))
        }
        None => None,
    };

    info!(
        agents = pool.len(),
        endpoint = %config.endpoint,
        build_path = %config.build_path.display(),
        "Starting agent pool"
    );
    let result = pool.start().await;

    shutdown.cancel();
    if let Some(task) = status_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Status server failed: {}", e),
            Err(e) => warn!("Status server task failed: {}", e),
        }
    }
    signals.close();

    match result {
        Ok(()) => {
            info!("All agents stopped");
            Ok(())
        }
        Err(e) => {
            for failure in e.failures() {
                error!(agent = %failure.worker, error = %failure.error, "Agent failed");
            }
            Err(e).context("Agent pool stopped with errors")
        }
    }
}

fn build_pool(
    config: &AgentConfig,
    coordinator: Arc<dyn Coordinator>,
    runners: Arc<dyn RunnerFactory>,
    pty: bool,
) -> AgentPool {
    let registration = Registration::from_config(config, supported_features(pty));
    let workers = (1..=registration.spawn)
        .map(|index| {
            let request = registration.request_for(index);
            let worker_config = WorkerConfig::from_agent_config(config, index, request);
            AgentWorker::new(worker_config, coordinator.clone(), runners.clone())
        })
        .collect();

    AgentPool::new(workers)
}
