//! Public key authentication
//!
//! Runs inside the handshake, once per key the client offers. Holds no
//! per-attempt state: every call is a pure function of the claimed user,
//! the key, and the gateway's answer.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use russh::keys::{Algorithm, PublicKey};
use tokio_util::sync::CancellationToken;

use crate::gateway::{AuthorizationGateway, GatewayError};

/// Upper bound on one authorization backend call
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Extension name carrying the backend's key id
pub const KEY_ID_EXTENSION: &str = "key-id";

/// Authenticated principal, as handed to sessions
///
/// Carries string-keyed extensions set during authentication; the backend's
/// key id lives under [`KEY_ID_EXTENSION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    extensions: HashMap<String, String>,
}

impl Identity {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            extensions: HashMap::from([(KEY_ID_EXTENSION.to_string(), key_id.into())]),
        }
    }

    pub fn key_id(&self) -> &str {
        self.extensions
            .get(KEY_ID_EXTENSION)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn extensions(&self) -> &HashMap<String, String> {
        &self.extensions
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("{0} keys are prohibited")]
    ProhibitedAlgorithm(Algorithm),

    #[error("failed to encode public key: {0}")]
    Encoding(String),

    #[error("authorization backend: {0}")]
    Gateway(#[from] GatewayError),

    #[error("authorization backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed during authentication")]
    Cancelled,
}

/// Rules applied to every public key attempt
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    user: String,
    prohibited: Vec<Algorithm>,
    timeout: Duration,
}

impl AuthPolicy {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            prohibited: vec![Algorithm::Dsa],
            timeout: AUTH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Checks that need no network round trip.
    pub fn check_claim(&self, user: &str, algorithm: &Algorithm) -> Result<(), AuthError> {
        if user != self.user {
            return Err(AuthError::UnknownUser(user.to_string()));
        }
        if self.prohibited.contains(algorithm) {
            return Err(AuthError::ProhibitedAlgorithm(algorithm.clone()));
        }
        Ok(())
    }

    /// Full decision for one key: local checks, then the backend under the
    /// timeout. `cancel` fires when the connection goes away.
    pub async fn authorize(
        &self,
        gateway: &dyn AuthorizationGateway,
        user: &str,
        key: &PublicKey,
        cancel: &CancellationToken,
    ) -> Result<Identity, AuthError> {
        self.check_claim(user, &key.algorithm())?;
        let fingerprint = fingerprint(key)?;

        let lookup = tokio::time::timeout(self.timeout, gateway.get_by_key(&fingerprint));
        tokio::select! {
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            result = lookup => match result {
                Err(_) => Err(AuthError::Timeout(self.timeout)),
                Ok(Err(e)) => Err(e.into()),
                Ok(Ok(authorized)) => Ok(Identity::new(authorized.id.to_string())),
            },
        }
    }
}

/// Unpadded base64 of the key's wire encoding, as the backend indexes keys.
pub fn fingerprint(key: &PublicKey) -> Result<String, AuthError> {
    let bytes = key
        .to_bytes()
        .map_err(|e| AuthError::Encoding(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::AuthorizedKey;
    use async_trait::async_trait;
    use russh::keys::PrivateKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DSA_KEY: &str = "ssh-dss AAAAB3NzaC1kc3MAAACBAKnSqmkmixp65Lc9xrfEoIG+j4UgikPlt6Y+DpcRuQDW5CSyDGIHJTUFzee51orctwNypwZp5BVPpooahoXJdJSrDElNrFjrv/7CQ7u6vNgklt/AKM6eYajkqxoR6sA611k9D+8dTIGfNrFinjIpohNsM0bQaZJTJXrhgWI9UQLzAAAAFQCJTVbnmbdR6mLSSlbgKgThaOEgewAAAIEAmxCmf8/kTbKzEBuiwoOelIgcZ3aF/xXYAfLe7qmFlOqMCtEO0XsnLptgPvsfuk2S/sTaPyJPGZ3gThKIrXz3zj5dJsux/zWlRlsUliGLhdJAbyQLSzkpF0zxo6WwNek9043PPn50hTqB8aByLxt3d9EBK8eI87h2apNHAT/Aph0AAACALyphtN4XLmTPVQV1/pGQxrvQoqzsN20+7oOlOAIaeEnxj9kpssGpa4DCIozy5XiVEbheqvCXGBeG/Nq7cQHMda9CDycnrxORmLucJmMO/5rKx5QvcJUXf8s+CPxThRsEe/iZcvaMygJFFHZ17Xw745rNKPm+Y3yEVJosOKQ8DEY= test@sshgate";

    /// Gateway that counts calls and answers after an optional delay
    struct FakeGateway {
        calls: AtomicUsize,
        delay: Duration,
        answer: Option<i64>,
    }

    impl FakeGateway {
        fn new(answer: Option<i64>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                answer,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthorizationGateway for FakeGateway {
        async fn get_by_key(&self, fingerprint: &str) -> Result<AuthorizedKey, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.answer {
                Some(id) => Ok(AuthorizedKey {
                    id,
                    key: fingerprint.to_string(),
                }),
                None => Err(GatewayError::Denied),
            }
        }
    }

    fn ed25519() -> PublicKey {
        PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_identity_extensions() {
        let identity = Identity::new("42");
        assert_eq!(identity.key_id(), "42");
        assert_eq!(identity.extensions().get("key-id").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_check_claim() {
        let policy = AuthPolicy::new("git");
        assert!(policy.check_claim("git", &Algorithm::Ed25519).is_ok());
        assert!(matches!(
            policy.check_claim("root", &Algorithm::Ed25519),
            Err(AuthError::UnknownUser(_))
        ));
        assert!(matches!(
            policy.check_claim("git", &Algorithm::Dsa),
            Err(AuthError::ProhibitedAlgorithm(Algorithm::Dsa))
        ));
    }

    #[test]
    fn test_fingerprint_matches_openssh_body() {
        let key = ed25519();
        let openssh = key.to_openssh().unwrap();
        let body = openssh.split_whitespace().nth(1).unwrap();
        assert_eq!(fingerprint(&key).unwrap(), body.trim_end_matches('='));
    }

    #[tokio::test]
    async fn test_accepts_known_key() {
        let gateway = FakeGateway::new(Some(99));
        let policy = AuthPolicy::new("git");

        let identity = policy
            .authorize(&gateway, "git", &ed25519(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(identity.key_id(), "99");
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_dsa_rejected_without_backend_call() {
        let gateway = FakeGateway::new(Some(1));
        let policy = AuthPolicy::new("git");
        let key = PublicKey::from_openssh(DSA_KEY).unwrap();

        let err = policy
            .authorize(&gateway, "git", &key, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProhibitedAlgorithm(_)));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_user_rejected_without_backend_call() {
        let gateway = FakeGateway::new(Some(1));
        let policy = AuthPolicy::new("git");

        let err = policy
            .authorize(&gateway, "admin", &ed25519(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownUser(_)));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_backend_denial() {
        let gateway = FakeGateway::new(None);
        let policy = AuthPolicy::new("git");

        let err = policy
            .authorize(&gateway, "git", &ed25519(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Gateway(GatewayError::Denied)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout() {
        let mut gateway = FakeGateway::new(Some(1));
        gateway.delay = Duration::from_secs(60);
        let policy = AuthPolicy::new("git");

        let err = policy
            .authorize(&gateway, "git", &ed25519(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout(t) if t == AUTH_TIMEOUT));
    }

    #[tokio::test]
    async fn test_cancelled_connection() {
        let mut gateway = FakeGateway::new(Some(1));
        gateway.delay = Duration::from_secs(60);
        let policy = AuthPolicy::new("git");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = policy
            .authorize(&gateway, "git", &ed25519(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }
}
