//! SSH server module
//!
//! Owns the listener and its lifecycle. Every accepted connection runs in
//! its own supervised task; a panic there is logged and contained.

mod auth;
mod connection;
mod handler;
mod limiter;
pub mod proxy;
mod session;

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use russh::{MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch::{CommandDispatcher, ProcessDispatcher};
use crate::error::ServerError;
use crate::gateway::{AuthorizationGateway, HttpGateway};
use crate::hostkeys::HostKeyStore;
use crate::status::{ServerStatus, StatusCell};

pub use auth::{fingerprint, AuthError, AuthPolicy, Identity, AUTH_TIMEOUT, KEY_ID_EXTENSION};
pub use connection::Connection;
pub use handler::{ConnectionHandler, Services};
pub use limiter::{LimitReached, SessionLimiter, SessionPermit};
pub use proxy::PROXY_HEADER_TIMEOUT;
pub use session::{Session, FAILURE_EXIT_STATUS};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// The SSH gateway server
pub struct Server {
    config: Config,
    status: StatusCell,
    ssh_config: Arc<russh::server::Config>,
    services: Arc<Services>,
    local_addr: Mutex<Option<SocketAddr>>,
    close_listener: CancellationToken,
    connections: TaskTracker,
    proxy_header_timeout: Duration,
}

impl Server {
    /// Build a server talking to the configured HTTP backend and running
    /// the configured command for each session.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let gateway = HttpGateway::new(&config)?;
        let dispatcher = ProcessDispatcher::new(config.command.clone());
        Self::with_services(config, Arc::new(gateway), Arc::new(dispatcher))
    }

    pub fn with_services(
        config: Config,
        gateway: Arc<dyn AuthorizationGateway>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Result<Self, ServerError> {
        let host_keys = HostKeyStore::load(&config.server.host_key_files)?;
        info!(count = host_keys.len(), "host keys loaded");

        let ssh_config = russh::server::Config {
            keys: host_keys.into_keys(),
            methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
            ..Default::default()
        };

        let services = Services {
            gateway,
            dispatcher,
            policy: AuthPolicy::new(config.user.clone()),
        };

        Ok(Self {
            config,
            status: StatusCell::new(),
            ssh_config: Arc::new(ssh_config),
            services: Arc::new(services),
            local_addr: Mutex::new(None),
            close_listener: CancellationToken::new(),
            connections: TaskTracker::new(),
            proxy_header_timeout: PROXY_HEADER_TIMEOUT,
        })
    }

    /// Override the authorization backend deadline.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        if let Some(services) = Arc::get_mut(&mut self.services) {
            services.policy = services.policy.clone().with_timeout(timeout);
        }
        self
    }

    /// Override how long a connection may take to send its PROXY header.
    pub fn with_proxy_header_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_header_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        self.status.get()
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local_addr.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Bind, serve until [`Server::shutdown`], and drain in-flight
    /// connections. `ctx` is the parent of every per-connection token.
    pub async fn listen_and_serve(&self, ctx: &CancellationToken) -> Result<(), ServerError> {
        let listener = self.listen().await?;
        self.serve(listener, ctx).await;
        Ok(())
    }

    /// Stop accepting. Connections already admitted finish on their own.
    pub fn shutdown(&self) {
        if self.local_addr().is_none() {
            return;
        }
        self.status.advance(ServerStatus::OnShutdown);
        self.close_listener.cancel();
    }

    async fn listen(&self) -> Result<TcpListener, ServerError> {
        let addr = &self.config.server.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

        if self.config.server.proxy_protocol {
            info!("proxy protocol is enabled");
        }
        info!(tcp_address = %local_addr, "listening for SSH connections");

        match self.local_addr.lock() {
            Ok(mut guard) => *guard = Some(local_addr),
            Err(poisoned) => *poisoned.into_inner() = Some(local_addr),
        }
        Ok(listener)
    }

    async fn serve(&self, listener: TcpListener, ctx: &CancellationToken) {
        self.status.advance(ServerStatus::Ready);

        loop {
            let accepted = tokio::select! {
                _ = self.close_listener.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr, ctx),
                Err(e) => {
                    if self.status.get() == ServerStatus::OnShutdown {
                        break;
                    }
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        self.connections.close();
        info!(in_flight = self.connections.len(), "listener closed, draining connections");
        self.connections.wait().await;

        self.status.advance(ServerStatus::Closed);
        info!("server closed");
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr, ctx: &CancellationToken) {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "connection",
            correlation_id = %correlation_id,
            remote_addr = tracing::field::Empty,
        );

        let cancel = ctx.child_token();
        let services = self.services.clone();
        let ssh_config = self.ssh_config.clone();
        let sessions_limit = self.config.server.concurrent_sessions_limit;
        let proxy_header_timeout = self
            .config
            .server
            .proxy_protocol
            .then_some(self.proxy_header_timeout);

        self.connections.spawn(
            async move {
                let _cancel_on_exit = cancel.clone().drop_guard();
                let outcome = AssertUnwindSafe(handle_connection(
                    stream,
                    peer_addr,
                    proxy_header_timeout,
                    sessions_limit,
                    correlation_id,
                    ssh_config,
                    services,
                    cancel,
                ))
                .catch_unwind()
                .await;

                match outcome {
                    Ok(Ok(())) => {}
                    // A panic in the transport task russh spawns arrives as a join error.
                    Ok(Err(e)) if is_join_error(&e) => warn!(
                        %peer_addr,
                        recovered_error = %e,
                        "panic handling connection"
                    ),
                    Ok(Err(e)) => info!(error = %e, "connection ended with error"),
                    Err(panic) => warn!(
                        %peer_addr,
                        recovered_error = %session::panic_message(&*panic),
                        "panic handling connection"
                    ),
                }
            }
            .instrument(span),
        );
    }
}

fn is_join_error(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<russh::Error>(), Some(russh::Error::Join(_)))
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    proxy_header_timeout: Option<Duration>,
    sessions_limit: i64,
    correlation_id: String,
    ssh_config: Arc<russh::server::Config>,
    services: Arc<Services>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut remote_addr = peer_addr;
    if let Some(timeout) = proxy_header_timeout {
        match proxy::read_header(&mut stream, timeout).await {
            Ok(Some(addr)) => remote_addr = addr,
            Ok(None) => {}
            Err(e) => {
                info!(%peer_addr, error = %e, "failed to read proxy header");
                return Ok(());
            }
        }
    }
    tracing::Span::current().record("remote_addr", tracing::field::display(remote_addr));
    info!("accepted connection");

    let connection = Connection::new(sessions_limit, remote_addr.to_string(), correlation_id);
    connection.serve(ssh_config, stream, services, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_error_is_classified_as_panic() {
        let join = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert!(is_join_error(&anyhow::Error::from(russh::Error::Join(join))));

        assert!(!is_join_error(&anyhow::anyhow!("peer went away")));
        assert!(!is_join_error(&anyhow::Error::from(russh::Error::Disconnect)));
    }
}
