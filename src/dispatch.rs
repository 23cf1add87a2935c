//! Command dispatch for authenticated sessions
//!
//! A session hands its single exec/shell request to a [`CommandDispatcher`]
//! together with the channel's byte streams. What the command means is the
//! dispatcher's business; the session only cares about the exit status.

use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandConfig;
use crate::ssh::Identity;

/// The one environment variable clients may pass through
pub const GIT_PROTOCOL_ENV: &str = "GIT_PROTOCOL";

/// What the client asked the channel to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Exec(String),
    Shell,
}

/// Everything a dispatcher gets to know about a session
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub kind: RequestKind,
    /// Accepted `env` requests, in receipt order
    pub env: Vec<(String, String)>,
    pub identity: Identity,
    pub remote_addr: String,
    pub correlation_id: String,
}

impl CommandRequest {
    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Exec(command) => Some(command),
            RequestKind::Shell => None,
        }
    }

    pub fn git_protocol(&self) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(name, _)| name == GIT_PROTOCOL_ENV)
            .map(|(_, value)| value.as_str())
    }
}

/// Byte streams of one channel
pub struct SessionIo<'a> {
    pub stdin: Pin<Box<dyn AsyncRead + Send + 'a>>,
    pub stdout: Pin<Box<dyn AsyncWrite + Send + 'a>>,
    pub stderr: Pin<Box<dyn AsyncWrite + Send + 'a>>,
}

impl<'a> SessionIo<'a> {
    pub fn new(
        stdin: impl AsyncRead + Send + 'a,
        stdout: impl AsyncWrite + Send + 'a,
        stderr: impl AsyncWrite + Send + 'a,
    ) -> Self {
        Self {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{0} is not supported")]
    UnsupportedRequest(String),

    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one request to completion and returns its exit status
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        request: CommandRequest,
        io: SessionIo<'_>,
    ) -> Result<u32, DispatchError>;
}

/// Runs the configured program as a child process, one per session
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    config: CommandConfig,
}

impl ProcessDispatcher {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &CommandRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(format!("key-{}", request.identity.key_id()))
            .env("SSHGATE_REMOTE_ADDR", &request.remote_addr)
            .env("CORRELATION_ID", &request.correlation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(command) = request.command() {
            cmd.env("SSH_ORIGINAL_COMMAND", command);
        }
        if let Some(protocol) = request.git_protocol() {
            cmd.env(GIT_PROTOCOL_ENV, protocol);
        }
        cmd
    }
}

#[async_trait]
impl CommandDispatcher for ProcessDispatcher {
    async fn dispatch(
        &self,
        request: CommandRequest,
        io: SessionIo<'_>,
    ) -> Result<u32, DispatchError> {
        let SessionIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;

        let mut child = self.command(&request).spawn().map_err(DispatchError::Spawn)?;
        debug!(
            program = %self.config.program.display(),
            pid = child.id(),
            "spawned command"
        );

        let (Some(mut child_stdin), Some(mut child_stdout), Some(mut child_stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(DispatchError::Spawn(std::io::Error::other(
                "child stdio was not captured",
            )));
        };

        // Client input may outlive the child; the child's exit decides completion.
        let input = async move {
            let _ = tokio::io::copy(&mut stdin, &mut child_stdin).await;
            let _ = child_stdin.shutdown().await;
        };
        let output = async {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut child_stdout, &mut stdout),
                tokio::io::copy(&mut child_stderr, &mut stderr),
            );
            out?;
            err?;
            stdout.flush().await?;
            stderr.flush().await?;
            Ok::<_, std::io::Error>(child.wait().await?)
        };
        tokio::pin!(input);
        tokio::pin!(output);

        let mut input_done = false;
        let status = loop {
            tokio::select! {
                status = &mut output => break status?,
                _ = &mut input, if !input_done => input_done = true,
            }
        };

        Ok(status.code().map(|c| c as u32).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn request(kind: RequestKind) -> CommandRequest {
        CommandRequest {
            kind,
            env: vec![],
            identity: Identity::new("7"),
            remote_addr: "127.0.0.1:5000".to_string(),
            correlation_id: "corr-1".to_string(),
        }
    }

    fn sh(script: &str) -> ProcessDispatcher {
        ProcessDispatcher::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        })
    }

    #[test]
    fn test_git_protocol_last_wins() {
        let mut req = request(RequestKind::Shell);
        req.env = vec![
            ("GIT_PROTOCOL".to_string(), "version=1".to_string()),
            ("LANG".to_string(), "C".to_string()),
            ("GIT_PROTOCOL".to_string(), "version=2".to_string()),
        ];
        assert_eq!(req.git_protocol(), Some("version=2"));
        assert_eq!(req.command(), None);
    }

    #[tokio::test]
    async fn test_process_receives_key_and_command() {
        let dispatcher = sh("echo \"$1 $SSH_ORIGINAL_COMMAND\"; echo oops >&2; exit 3");
        let (out_w, mut out_r) = tokio::io::duplex(1024);
        let (err_w, mut err_r) = tokio::io::duplex(1024);

        let io = SessionIo::new(tokio::io::empty(), out_w, err_w);
        let code = dispatcher
            .dispatch(
                request(RequestKind::Exec("git-upload-pack 'group/project.git'".into())),
                io,
            )
            .await
            .unwrap();
        assert_eq!(code, 3);

        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "key-7 git-upload-pack 'group/project.git'\n");

        let mut err = String::new();
        err_r.read_to_string(&mut err).await.unwrap();
        assert_eq!(err, "oops\n");
    }

    #[tokio::test]
    async fn test_process_reads_stdin() {
        let dispatcher = sh("cat");
        let (out_w, mut out_r) = tokio::io::duplex(1024);

        let io = SessionIo::new(&b"pack data"[..], out_w, tokio::io::sink());
        let code = dispatcher
            .dispatch(request(RequestKind::Shell), io)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let mut out = String::new();
        out_r.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "pack data");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dispatcher = ProcessDispatcher::new(CommandConfig {
            program: "/nonexistent/sshgate-command".into(),
            args: vec![],
        });
        let io = SessionIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink());

        let err = dispatcher
            .dispatch(request(RequestKind::Shell), io)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Spawn(_)));
    }
}
