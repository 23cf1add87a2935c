//! Testing utilities for sshgate
//!
//! Provides an SSH test client for driving a running gateway in tests.

mod ssh_client;

pub use ssh_client::{ClientHandler, ExecOutput, SessionChannel, SshTestClient};
