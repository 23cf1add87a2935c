//! Host key loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use tracing::{info, warn};

use crate::error::ServerError;

/// Signing identities presented in every handshake, in configured order
#[derive(Debug)]
pub struct HostKeyStore {
    keys: Vec<PrivateKey>,
}

impl HostKeyStore {
    /// Load every readable, parseable key. Bad files are skipped with a
    /// warning; ending up with no keys at all is fatal.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ServerError> {
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            match load_key(path) {
                Ok(key) => {
                    info!(path = %path.display(), algorithm = %key.algorithm(), "loaded host key");
                    keys.push(key);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %format!("{e:#}"), "skipping host key");
                }
            }
        }

        if keys.is_empty() {
            return Err(ServerError::no_host_keys(paths));
        }
        Ok(Self { keys })
    }

    pub fn into_keys(self) -> Vec<PrivateKey> {
        self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let raw = std::fs::read_to_string(path).context("failed to read host key")?;
    russh::keys::decode_secret_key(&raw, None).context("failed to parse host key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::LineEnding;
    use russh::keys::Algorithm;

    fn write_ed25519(dir: &Path, name: &str) -> PathBuf {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_valid_and_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_ed25519(dir.path(), "ssh_host_ed25519_key");
        let missing = dir.path().join("does_not_exist");

        let store = HostKeyStore::load(&[missing, good]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys[0].algorithm(), Algorithm::Ed25519);
    }

    #[test]
    fn test_garbage_key_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, "not a key").unwrap();
        let good = write_ed25519(dir.path(), "good");

        let store = HostKeyStore::load(&[garbage, good]).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_keeps_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_ed25519(dir.path(), "first");
        let second = write_ed25519(dir.path(), "second");
        let expected = russh::keys::decode_secret_key(
            &std::fs::read_to_string(&second).unwrap(),
            None,
        )
        .unwrap();

        let store = HostKeyStore::load(&[first, second]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.keys[1].public_key(), expected.public_key());
    }

    #[test]
    fn test_no_usable_keys_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostKeyStore::load(&[dir.path().join("a"), dir.path().join("b")]).unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));

        let err = HostKeyStore::load(&[]).unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
    }
}
