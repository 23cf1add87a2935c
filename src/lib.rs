//! sshgate - an SSH front door for git hosting
//!
//! Accepts SSH connections, authorizes public keys against an HTTP
//! backend, and hands each session's command to a dispatcher. The binary
//! lives in `main.rs`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod hostkeys;
pub mod logging;
pub mod monitoring;
pub mod ssh;
pub mod status;
pub mod testing;

pub use config::Config;
pub use error::ServerError;
pub use ssh::Server;
pub use status::ServerStatus;
