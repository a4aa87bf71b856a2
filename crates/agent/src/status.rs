//! Read-only status server
//!
//! `GET /status` returns the pool's busy/idle state and every worker's
//! state as JSON. `GET /healthz` answers `OK` while the process is up.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pool::{AgentPool, PoolStatus};

/// Source of the status document
pub trait StatusSource: Send + Sync {
    fn status(&self) -> PoolStatus;
}

impl StatusSource for AgentPool {
    fn status(&self) -> PoolStatus {
        AgentPool::status(self)
    }
}

type SharedSource = Arc<dyn StatusSource>;

pub fn router(source: SharedSource) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(source)
}

async fn status(State(source): State<SharedSource>) -> Json<PoolStatus> {
    Json(source.status())
}

async fn healthz() -> &'static str {
    "OK"
}

/// A bound, not yet serving, status server
pub struct StatusServer {
    listener: TcpListener,
}

impl StatusServer {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, source: SharedSource, shutdown: CancellationToken) -> std::io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Status server listening on {}", addr);
        }
        axum::serve(self.listener, router(source))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
