//! sshgate - SSH gateway for git hosting
//!
//! Loads config, starts the SSH listener and the probe server, and shuts
//! both down on SIGINT or SIGTERM, giving in-flight sessions a grace
//! period to finish.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sshgate::config::Config;
use sshgate::monitoring::ProbeServer;
use sshgate::{logging, Server};

const CONFIG_ENV: &str = "SSHGATE_CONFIG";
const DEFAULT_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sshgate: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config) {
        eprintln!("sshgate: failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sshgate exited with error");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<Config> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = Config::load(&path)?;
    config.check().context("invalid configuration")?;
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    let grace_period = config.server.grace_period();
    info!(listen = %config.server.listen, "starting sshgate");

    let server = Arc::new(Server::new(config).context("failed to start server")?);

    let root_ctx = CancellationToken::new();
    let monitoring_ctx = root_ctx.child_token();

    let probe_server = ProbeServer::bind(server.clone()).await?;
    let mut probes = tokio::spawn(probe_server.serve(monitoring_ctx.clone()));

    let mut ssh = {
        let server = server.clone();
        let ctx = root_ctx.clone();
        tokio::spawn(async move { server.listen_and_serve(&ctx).await })
    };

    tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            info!(%signal, "shutdown initiated");
        }
        result = &mut ssh => {
            // The listener stopped without being asked to; usually a bind error.
            monitoring_ctx.cancel();
            result.context("ssh server task failed")??;
            return Ok(());
        }
        result = &mut probes => {
            server.shutdown();
            root_ctx.cancel();
            result.context("monitoring task failed")??;
            anyhow::bail!("monitoring server stopped unexpectedly");
        }
    }

    server.shutdown();

    match tokio::time::timeout(grace_period, &mut ssh).await {
        Ok(result) => {
            result.context("ssh server task failed")??;
            info!("all connections drained");
        }
        Err(_) => {
            warn!(grace_period = ?grace_period, "grace period expired, cancelling connections");
            root_ctx.cancel();
        }
    }

    monitoring_ctx.cancel();
    match probes.await {
        Ok(Err(e)) => warn!(error = %format!("{e:#}"), "monitoring server stopped with error"),
        Err(e) => warn!(error = %e, "monitoring task failed"),
        Ok(Ok(())) => {}
    }

    info!("sshgate stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = term.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}
