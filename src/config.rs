//! Configuration loading.
//!
//! Switchboard reads a single `config.toml`. Lookup order for the file is
//! `--config`, then `$SWITCHBOARD_CONFIG`, then `~/.switchboard/config.toml`.
//! A missing file yields defaults. Environment variables override file values.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Tenant database and attachment storage.
    pub storage: StorageConfig,
    /// Protocol sidecar connection.
    pub bridge: BridgeConfig,
    /// Session lifecycle tuning.
    pub session: SessionConfig,
    /// Outbound webhook delivery.
    pub webhook: WebhookConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration: resolve the file, parse it, apply env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if no explicit path is given and the home directory is unknown.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let path = config_path_with(explicit, &env)?;
        let mut config = Self::load_file(&path)?;
        config.apply_overrides(&env);
        Ok(config)
    }

    fn load_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrong field types.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SWITCHBOARD_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = env("SWITCHBOARD_DATABASE") {
            self.storage.database = PathBuf::from(v);
        }
        if let Some(v) = env("SWITCHBOARD_FILES_DIR") {
            self.storage.files_dir = PathBuf::from(v);
        }
        if let Some(v) = env("SWITCHBOARD_BRIDGE_URL") {
            self.bridge.url = v;
        }
        if let Some(v) = env("SWITCHBOARD_WEBHOOK_MAX_IN_FLIGHT") {
            match v.parse::<usize>() {
                Ok(n) => self.webhook.max_in_flight = Some(n),
                Err(_) => warn!(
                    var = "SWITCHBOARD_WEBHOOK_MAX_IN_FLIGHT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_owned(),
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite tenant database.
    pub database: PathBuf,
    /// Root of the per-tenant attachment directories.
    pub files_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/switchboard.db"),
            files_dir: PathBuf::from("files"),
        }
    }
}

/// Protocol sidecar connection.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Sidecar base URL.
    #[serde(default = "default_bridge_url")]
    pub url: String,
    /// Long-poll timeout for pairing and event streams.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// How long a non-immediate connect request waits for the session to come up.
    #[serde(default = "default_connect_grace")]
    pub connect_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_grace_secs: default_connect_grace(),
        }
    }
}

/// Outbound webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Per-request timeout.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Redirect hops followed before giving up.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Accept self-signed and otherwise invalid TLS certificates.
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
    /// Cap on concurrent deliveries; unset means unbounded.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
            max_redirects: default_max_redirects(),
            accept_invalid_certs: default_accept_invalid_certs(),
            max_in_flight: None,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs.
    pub dir: PathBuf,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_owned(),
        }
    }
}

// Default value functions for serde

fn default_bridge_url() -> String {
    "http://127.0.0.1:3001".to_owned()
}
fn default_poll_timeout() -> u64 {
    60
}
fn default_connect_grace() -> u64 {
    10
}
fn default_webhook_timeout() -> u64 {
    5
}
fn default_max_redirects() -> usize {
    15
}
fn default_accept_invalid_certs() -> bool {
    true
}

/// Resolve the default config directory (`~/.switchboard/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".switchboard"))
}

fn config_path_with(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = env("SWITCHBOARD_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}
