//! Authorization backend interface
//!
//! The gateway maps a presented public key to the backend's key record.
//! Any error means "not authorized"; the caller never forwards details to
//! the SSH client.

pub mod http;

use async_trait::async_trait;
use serde::Deserialize;

pub use http::HttpGateway;

/// Key record returned by the backend for an authorized key
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizedKey {
    pub id: i64,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("key is not authorized")]
    Denied,

    #[error("invalid backend response: {0}")]
    Decode(String),
}

/// Looks up a public key with the authorization backend
#[async_trait]
pub trait AuthorizationGateway: Send + Sync {
    /// `fingerprint` is the unpadded base64 of the key's wire encoding.
    async fn get_by_key(&self, fingerprint: &str) -> Result<AuthorizedKey, GatewayError>;
}
