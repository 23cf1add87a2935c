//! Fatal startup errors

use std::path::PathBuf;

/// Conditions that stop the gateway before it serves any traffic
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to initialize authorization client: {0}")]
    DependencyInit(String),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    pub(crate) fn no_host_keys(tried: &[PathBuf]) -> Self {
        Self::Configuration(format!(
            "no host keys could be loaded from {} configured file(s), aborting",
            tried.len()
        ))
    }
}
