//! Background heartbeats for a connected agent

use std::sync::Arc;

use raibid_common::{AgentIdentity, Coordinator};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::{break_if_terminal, Retrier, RetryPolicy};

/// Heartbeat task bound to one worker run
///
/// Dropping it cancels the task; [`Heartbeat::stop`] also waits for it.
pub(crate) struct Heartbeat {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn(
        coordinator: Arc<dyn Coordinator>,
        agent: AgentIdentity,
        policy: RetryPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let interval = agent.heartbeat_interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let result = Retrier::new("heartbeat", policy.clone())
                    .run_with_cancel(&token, |attempt| {
                        let coordinator = &coordinator;
                        let agent = &agent;
                        async move {
                            coordinator
                                .heartbeat(agent)
                                .await
                                .map_err(|e| break_if_terminal(&attempt, e))
                        }
                    })
                    .await;

                match result {
                    Ok(()) => debug!(agent = %agent.name, "Heartbeat sent"),
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => warn!(agent = %agent.name, error = %e, "Heartbeat failed"),
                }
            }
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
