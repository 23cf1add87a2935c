//! Tracing subscriber setup

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("sshgate={}", config.log_level)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "text" {
        builder.try_init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
    }

    Ok(())
}
