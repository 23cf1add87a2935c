//! SSH connection handler
//!
//! The russh callbacks for one connection: public key authentication
//! during the handshake, then admission of session channels.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use crate::dispatch::CommandDispatcher;
use crate::gateway::AuthorizationGateway;
use crate::ssh::auth::{AuthPolicy, Identity};
use crate::ssh::limiter::SessionLimiter;
use crate::ssh::session::{panic_message, Session as ChannelSession};

/// Collaborators shared by every connection of a server
pub struct Services {
    pub gateway: Arc<dyn AuthorizationGateway>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub policy: AuthPolicy,
}

/// Per-connection SSH handler
///
/// russh drives the callbacks from its own task, so every callback runs
/// inside `span`, the connection's span, to keep the correlation id.
pub struct ConnectionHandler {
    services: Arc<Services>,
    span: Span,
    remote_addr: String,
    correlation_id: String,
    cancel: CancellationToken,
    limiter: SessionLimiter,
    sessions: TaskTracker,
    identity: Option<Identity>,
}

impl ConnectionHandler {
    pub fn new(
        services: Arc<Services>,
        remote_addr: String,
        correlation_id: String,
        cancel: CancellationToken,
        limiter: SessionLimiter,
        sessions: TaskTracker,
        span: Span,
    ) -> Self {
        Self {
            services,
            span,
            remote_addr,
            correlation_id,
            cancel,
            limiter,
            sessions,
            identity: None,
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    async fn authenticate(&mut self, user: &str, key: &PublicKey) -> Auth {
        let lookup = self.services.policy.authorize(
            self.services.gateway.as_ref(),
            user,
            key,
            &self.cancel,
        );

        match AssertUnwindSafe(lookup).catch_unwind().await {
            Ok(Ok(identity)) => {
                info!(
                    key_id = identity.key_id(),
                    extensions = ?identity.extensions(),
                    "public key authenticated"
                );
                self.identity = Some(identity);
                Auth::Accept
            }
            Ok(Err(e)) => {
                info!(user, error = %e, "public key authentication failed");
                Self::reject()
            }
            Err(panic) => {
                warn!(
                    remote_addr = %self.remote_addr,
                    recovered_error = %panic_message(&*panic),
                    "panic in public key authentication"
                );
                Self::reject()
            }
        }
    }

    fn admit(&mut self, channel: Channel<Msg>, handle: server::Handle) -> bool {
        let Some(identity) = self.identity.clone() else {
            warn!(channel = ?channel.id(), "session channel before authentication");
            return false;
        };

        let permit = match self.limiter.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(channel = ?channel.id(), error = %e, "rejecting session channel");
                return false;
            }
        };

        debug!(
            channel = ?channel.id(),
            free = ?self.limiter.available(),
            "session channel admitted"
        );
        let session = ChannelSession::new(
            channel,
            handle,
            identity,
            self.remote_addr.clone(),
            self.correlation_id.clone(),
            permit,
        );
        let dispatcher = self.services.dispatcher.clone();
        self.sessions.spawn(
            async move {
                session.handle(dispatcher.as_ref()).await;
            }
            .instrument(self.span.clone()),
        );
        true
    }
}

impl server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let claim = self.services.policy.check_claim(user, &key.algorithm());
        Ok(self.span.in_scope(|| match claim {
            Ok(()) => Auth::Accept,
            Err(e) => {
                info!(user, error = %e, "public key refused");
                Self::reject()
            }
        }))
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let span = self.span.clone();
        Ok(self.authenticate(user, key).instrument(span).await)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let handle = session.handle();
        let span = self.span.clone();

        Ok(span.in_scope(|| {
            std::panic::catch_unwind(AssertUnwindSafe(|| self.admit(channel, handle)))
                .unwrap_or_else(|panic| {
                    warn!(
                        remote_addr = %self.remote_addr,
                        recovered_error = %panic_message(&*panic),
                        "panic admitting session channel"
                    );
                    false
                })
        }))
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, name, "refusing subsystem");
        let _ = session.channel_failure(channel);
        Ok(())
    }
}
