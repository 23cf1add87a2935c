//! One admitted session channel
//!
//! Waits for the channel's exec or shell request, hands it to the
//! dispatcher, and always finishes with an exit status and a close.
//! Nothing that happens here reaches the owning connection.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tracing::{debug, info, warn};

use crate::dispatch::{
    CommandDispatcher, CommandRequest, DispatchError, RequestKind, SessionIo, GIT_PROTOCOL_ENV,
};
use crate::ssh::auth::Identity;
use crate::ssh::limiter::SessionPermit;

/// SSH extended data type for stderr
const STDERR: u32 = 1;

/// Exit status reported when the command could not run
pub const FAILURE_EXIT_STATUS: u32 = 1;

/// Session state for one channel
pub struct Session {
    channel: Channel<Msg>,
    handle: Handle,
    identity: Identity,
    remote_addr: String,
    correlation_id: String,
    permit: Option<SessionPermit>,
}

/// How the channel's request phase ended
enum Request {
    Run(RequestKind),
    Refuse(DispatchError),
    Closed,
}

impl Session {
    pub fn new(
        channel: Channel<Msg>,
        handle: Handle,
        identity: Identity,
        remote_addr: String,
        correlation_id: String,
        permit: SessionPermit,
    ) -> Self {
        Self {
            channel,
            handle,
            identity,
            remote_addr,
            correlation_id,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Serve exactly one request, then close the channel.
    ///
    /// Returns the exit status sent to the client, or `None` if the client
    /// went away before asking for anything.
    pub async fn handle(mut self, dispatcher: &dyn CommandDispatcher) -> Option<u32> {
        let mut env = Vec::new();
        let request = self.next_request(&mut env).await;

        let code = match request {
            Request::Closed => {
                debug!(channel = ?self.id(), "channel closed before any request");
                self.release();
                self.close().await;
                return None;
            }
            Request::Refuse(e) => {
                self.report_error(&e).await;
                FAILURE_EXIT_STATUS
            }
            Request::Run(kind) => {
                let request = CommandRequest {
                    kind,
                    env,
                    identity: self.identity.clone(),
                    remote_addr: self.remote_addr.clone(),
                    correlation_id: self.correlation_id.clone(),
                };
                self.run(dispatcher, request).await
            }
        };

        self.release();
        self.finish(code).await;
        Some(code)
    }

    async fn next_request(&mut self, env: &mut Vec<(String, String)>) -> Request {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Exec { command, .. }) => {
                    let command = String::from_utf8_lossy(&command).into_owned();
                    return Request::Run(RequestKind::Exec(command));
                }
                Some(ChannelMsg::RequestShell { .. }) => return Request::Run(RequestKind::Shell),
                Some(ChannelMsg::RequestSubsystem { name, .. }) => {
                    return Request::Refuse(DispatchError::UnsupportedRequest(format!(
                        "subsystem {name}"
                    )));
                }
                Some(ChannelMsg::SetEnv {
                    variable_name,
                    variable_value,
                    ..
                }) => {
                    if variable_name == GIT_PROTOCOL_ENV {
                        env.push((variable_name, variable_value));
                    } else {
                        debug!(name = %variable_name, "ignoring env request");
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Request::Closed,
                Some(_) => {}
            }
        }
    }

    async fn run(&mut self, dispatcher: &dyn CommandDispatcher, request: CommandRequest) -> u32 {
        let command = request.command().map(str::to_owned);
        info!(channel = ?self.id(), command = ?command, "dispatching session");

        let stdout = self.channel.make_writer();
        let stderr = self.channel.make_writer_ext(Some(STDERR));
        let stdin = self.channel.make_reader();
        let io = SessionIo::new(stdin, stdout, stderr);

        let outcome = AssertUnwindSafe(dispatcher.dispatch(request, io))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                self.report_error(&e).await;
                FAILURE_EXIT_STATUS
            }
            Err(panic) => {
                warn!(
                    channel = ?self.id(),
                    recovered_error = %panic_message(&*panic),
                    "panic in command dispatch"
                );
                self.write_stderr("Internal API error").await;
                FAILURE_EXIT_STATUS
            }
        }
    }

    fn release(&mut self) {
        self.permit.take();
    }

    async fn report_error(&self, error: &DispatchError) {
        warn!(channel = ?self.id(), error = %error, "session failed");
        self.write_stderr(&error.to_string()).await;
    }

    async fn write_stderr(&self, message: &str) {
        let data = CryptoVec::from(format_error(message).into_bytes());
        if self.handle.extended_data(self.id(), STDERR, data).await.is_err() {
            debug!(channel = ?self.id(), "channel gone before error could be written");
        }
    }

    async fn finish(&self, code: u32) {
        info!(channel = ?self.id(), exit_status = code, "session finished");
        let _ = self.handle.exit_status_request(self.id(), code).await;
        self.close().await;
    }

    async fn close(&self) {
        let _ = self.handle.eof(self.id()).await;
        let _ = self.handle.close(self.id()).await;
    }
}

/// Message shape git clients print verbatim on stderr
fn format_error(message: &str) -> String {
    let rule = "=".repeat(72);
    format!("remote: \nremote: {rule}\nremote: \nremote: {message}\nremote: \nremote: {rule}\nremote: \n")
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error() {
        let text = format_error("Disallowed command");
        assert!(text.starts_with("remote: \n"));
        assert!(text.contains("remote: Disallowed command\n"));
        assert!(text.lines().all(|l| l.starts_with("remote:")));
    }

    #[test]
    fn test_panic_message() {
        let err = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*err), "boom");

        let err = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(&*err), "formatted 1");
    }
}
