//! Readiness and liveness probes
//!
//! Readiness follows the server status; liveness only proves the process
//! is scheduled and answering HTTP at all.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ssh::Server;

/// Router exposing the probes on the configured paths
pub fn router(server: Arc<Server>) -> Router {
    let readiness = server.config().server.readiness_probe.clone();
    let liveness = server.config().server.liveness_probe.clone();

    Router::new()
        .route(&readiness, get(readiness_probe))
        .route(&liveness, get(liveness_probe))
        .with_state(server)
}

async fn readiness_probe(State(server): State<Arc<Server>>) -> StatusCode {
    if server.status().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn liveness_probe() -> StatusCode {
    StatusCode::OK
}

/// Probe server bound to `web_listen`, not yet serving
pub struct ProbeServer {
    listener: TcpListener,
    router: Router,
}

impl ProbeServer {
    /// Bind `web_listen` and build the router, so that both fail before
    /// any traffic is served.
    pub async fn bind(server: Arc<Server>) -> Result<Self> {
        let addr = server.config().server.web_listen.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind monitoring listener on {addr}"))?;
        Ok(Self {
            listener,
            router: router(server),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve the probes until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr()?, "monitoring server listening");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("monitoring server error")
    }
}
