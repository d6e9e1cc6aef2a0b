//! Bridge configuration.
//!
//! Values resolve in this order, later sources winning: built-in defaults,
//! an optional JSON config file, a `.env` file in the working directory,
//! process environment variables, and finally command-line flags (applied by
//! the binary).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

pub const ENV_HOST: &str = "EDITOR_HOST";
pub const ENV_PORT: &str = "EDITOR_PORT";
pub const ENV_RECONNECT_INTERVAL_MS: &str = "BRIDGE_RECONNECT_INTERVAL_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "BRIDGE_CONNECT_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "BRIDGE_REQUEST_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "BRIDGE_POLL_INTERVAL_MS";
pub const ENV_EXECUTION_TIMEOUT_MS: &str = "BRIDGE_EXECUTION_TIMEOUT_MS";

/// Settings shared by the forwarder and the external service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Address the forwarder listens on and the service connects to.
    #[serde(default = "default_forwarder_host")]
    pub forwarder_host: String,

    #[serde(default = "default_forwarder_port")]
    pub forwarder_port: u16,

    /// Wait between failed reconnection attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default deadline for a single request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Receive loop and supervisor wake-up interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Limit on one interpreter run in the standalone forwarder.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
}

fn default_forwarder_host() -> String {
    "127.0.0.1".into()
}

const fn default_forwarder_port() -> u16 {
    8100
}

const fn default_reconnect_interval_ms() -> u64 {
    2_000
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_request_timeout_ms() -> u64 {
    60_000
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_execution_timeout_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forwarder_host: default_forwarder_host(),
            forwarder_port: default_forwarder_port(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
        }
    }
}

impl Config {
    /// Load from an optional config file, `./.env` and the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        Self::resolve(config_file, Path::new(".env"), |key| std::env::var(key).ok())
    }

    /// Load with an explicit `.env` location and environment lookup.
    pub fn resolve(
        config_file: Option<&Path>,
        dotenv_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let dotenv = match std::fs::read_to_string(dotenv_path) {
            Ok(contents) => {
                debug!(path = %dotenv_path.display(), "Loaded .env file");
                parse_env_file(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %dotenv_path.display(), error = %e, "Ignoring unreadable .env file");
                HashMap::new()
            }
        };

        config.apply_env(|key| env(key).or_else(|| dotenv.get(key).cloned()));
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Override fields from environment-style variables.
    ///
    /// An invalid port falls back to the default; other invalid values are
    /// ignored. Both cases log a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(ENV_HOST) {
            let host = host.trim();
            if !host.is_empty() {
                self.forwarder_host = host.to_string();
            }
        }

        if let Some(port) = lookup(ENV_PORT) {
            self.forwarder_port = match port.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    warn!(
                        key = ENV_PORT,
                        value = %port,
                        default = default_forwarder_port(),
                        "Invalid port; using default"
                    );
                    default_forwarder_port()
                }
            };
        }

        let millis = [
            (ENV_RECONNECT_INTERVAL_MS, &mut self.reconnect_interval_ms),
            (ENV_CONNECT_TIMEOUT_MS, &mut self.connect_timeout_ms),
            (ENV_REQUEST_TIMEOUT_MS, &mut self.request_timeout_ms),
            (ENV_POLL_INTERVAL_MS, &mut self.poll_interval_ms),
            (ENV_EXECUTION_TIMEOUT_MS, &mut self.execution_timeout_ms),
        ];
        for (key, field) in millis {
            let Some(value) = lookup(key) else {
                continue;
            };
            match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => *field = ms,
                _ => warn!(key, value = %value, "Ignoring invalid duration"),
            }
        }
    }

    /// `host:port` of the forwarder.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.forwarder_host, self.forwarder_port)
    }
}

/// Parse `KEY=value` lines. Blank lines, `#` comments and an `export `
/// prefix are accepted; matching surrounding quotes are stripped.
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = ['"', '\'']
            .iter()
            .find_map(|q| {
                value
                    .strip_prefix(*q)
                    .and_then(|rest| rest.strip_suffix(*q))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}
