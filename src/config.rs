//! Gateway configuration
//!
//! Loaded from a TOML file. Every key has a default except `gitlab_url` and
//! the shared secret, which [`Config::check`] insists on before startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use percent_encoding::percent_decode_str;
use serde::Deserialize;

const DEFAULT_SECRET_FILE: &str = ".gitlab_shell_secret";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The only account name clients may log in as
    pub user: String,
    /// Base URL of the authorization backend
    pub gitlab_url: String,
    /// Shared secret; wins over `secret_file` when set
    pub secret: String,
    /// Path to the shared secret, relative to the config file's directory
    pub secret_file: Option<PathBuf>,
    /// `json` or `text`
    pub log_format: String,
    /// Default tracing directive, overridden by `RUST_LOG`
    pub log_level: String,
    pub http_settings: HttpSettings,
    #[serde(rename = "sshd")]
    pub server: ServerConfig,
    pub command: CommandConfig,
    /// Directory the config file was read from
    #[serde(skip)]
    pub root_dir: PathBuf,
}

/// Listener and lifecycle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub proxy_protocol: bool,
    /// Address of the monitoring HTTP server
    pub web_listen: String,
    /// Maximum concurrently open sessions per connection, <= 0 is unbounded
    pub concurrent_sessions_limit: i64,
    /// Seconds to wait for connections to drain after a shutdown signal
    pub grace_period: u64,
    pub readiness_probe: String,
    pub liveness_probe: String,
    pub host_key_files: Vec<PathBuf>,
}

/// Settings for the HTTP client talking to the authorization backend
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user: String,
    pub password: String,
    /// Seconds
    pub read_timeout: u64,
    pub self_signed_cert: bool,
}

/// Program run for every authenticated session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: "git".to_string(),
            gitlab_url: String::new(),
            secret: String::new(),
            secret_file: None,
            log_format: "json".to_string(),
            log_level: "info".to_string(),
            http_settings: HttpSettings::default(),
            server: ServerConfig::default(),
            command: CommandConfig::default(),
            root_dir: PathBuf::from("."),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "[::]:22".to_string(),
            proxy_protocol: false,
            web_listen: "localhost:9122".to_string(),
            concurrent_sessions_limit: 10,
            grace_period: 10,
            readiness_probe: "/start".to_string(),
            liveness_probe: "/health".to_string(),
            host_key_files: vec![
                PathBuf::from("/run/secrets/ssh-hostkeys/ssh_host_rsa_key"),
                PathBuf::from("/run/secrets/ssh-hostkeys/ssh_host_ecdsa_key"),
                PathBuf::from("/run/secrets/ssh-hostkeys/ssh_host_ed25519_key"),
            ],
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            read_timeout: 300,
            self_signed_cert: false,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gitlab-shell"),
            args: vec![],
        }
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

impl HttpSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

impl Config {
    /// Load config from a TOML file, resolving the shared secret.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let mut config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.root_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.resolve_secret()?;

        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse config text without touching the filesystem.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.gitlab_url = percent_decode(&config.gitlab_url)?;
        Ok(config)
    }

    /// Minimum requirements to start serving traffic.
    pub fn check(&self) -> Result<()> {
        if self.gitlab_url.is_empty() {
            bail!("gitlab_url is required");
        }
        if self.secret.is_empty() {
            bail!("secret or secret_file is required");
        }

        let server = &self.server;
        for (name, path) in [
            ("readiness_probe", &server.readiness_probe),
            ("liveness_probe", &server.liveness_probe),
        ] {
            if !path.starts_with('/') {
                bail!("{name} must be an absolute path, got {path:?}");
            }
        }
        if server.readiness_probe == server.liveness_probe {
            bail!("readiness_probe and liveness_probe must differ");
        }
        Ok(())
    }

    fn resolve_secret(&mut self) -> Result<()> {
        if !self.secret.is_empty() {
            return Ok(());
        }

        let file = self
            .secret_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRET_FILE));
        let file = if file.is_absolute() {
            file
        } else {
            self.root_dir.join(file)
        };

        let secret = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read secret {}", file.display()))?;
        self.secret = secret.trim_end().to_string();
        self.secret_file = Some(file);
        Ok(())
    }
}

/// Decode `%XX` escapes in the backend URL. Malformed escapes pass through
/// unchanged.
fn percent_decode(input: &str) -> Result<String> {
    let decoded = percent_decode_str(input)
        .decode_utf8()
        .with_context(|| format!("escaped url {input:?} is not utf-8"))?;
    Ok(decoded.into_owned())
}
