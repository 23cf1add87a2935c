//! One accepted connection
//!
//! Runs the handshake and channel multiplexing for a single peer, then
//! waits for every session it admitted before reporting itself done.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, Span};

use crate::ssh::handler::{ConnectionHandler, Services};
use crate::ssh::limiter::SessionLimiter;

/// A connection and the sessions it owns
pub struct Connection {
    remote_addr: String,
    correlation_id: String,
    limiter: SessionLimiter,
    sessions: TaskTracker,
}

impl Connection {
    pub fn new(sessions_limit: i64, remote_addr: String, correlation_id: String) -> Self {
        Self {
            remote_addr,
            correlation_id,
            limiter: SessionLimiter::new(sessions_limit),
            sessions: TaskTracker::new(),
        }
    }

    /// Drive the SSH transport until it closes and its sessions return.
    pub async fn serve<S>(
        self,
        config: Arc<russh::server::Config>,
        stream: S,
        services: Arc<Services>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = ConnectionHandler::new(
            services,
            self.remote_addr.clone(),
            self.correlation_id.clone(),
            cancel,
            self.limiter.clone(),
            self.sessions.clone(),
            Span::current(),
        );

        let result = match russh::server::run_stream(config, stream, handler).await {
            Ok(running) => running.await,
            Err(e) => {
                info!(error = %e, "failed to initialize SSH connection");
                Ok(())
            }
        };

        self.sessions.close();
        if !self.sessions.is_empty() {
            debug!(sessions = self.sessions.len(), "waiting for sessions to finish");
        }
        self.sessions.wait().await;

        debug!("connection closed");
        result
    }
}
