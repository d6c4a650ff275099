//! Configuration loading and defaults.
//!
//! The agent is configured by a single JSON file, passed via
//! `--config <path>`:
//!
//! ```json
//! {
//!   "cloud": "ws://controller.example.com:3000/terminal",
//!   "command": "/bin/bash",
//!   "logLevel": "info"
//! }
//! ```
//!
//! `cloud` is required and must be a `ws://` or `wss://` URL. `command`
//! defaults to `/bin/bash`, `logLevel` to `info`. A missing or malformed
//! config file is a fatal startup error.

use serde::Deserialize;

/// Agent configuration, deserialized from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// WebSocket URL of the cloud controller (`ws://` or `wss://`).
    pub cloud: String,
    /// Shell binary spawned for each session (default `/bin/bash`).
    #[serde(default = "default_command")]
    pub command: String,
    /// Log filter level (default `info`). Overridden by `RUST_LOG` env var.
    /// One of `debug`, `info`, `warn`, `error`, `fatal`.
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
}

fn default_command() -> String {
    "/bin/bash".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 5] = ["debug", "info", "warn", "error", "fatal"];

impl Config {
    /// Load and validate the configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.cloud.starts_with("ws://") && !self.cloud.starts_with("wss://") {
            return Err(ConfigError::InvalidCloudUrl(self.cloud.clone()));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }

    /// The `tracing` filter directive for the configured level.
    ///
    /// `fatal` maps to `error` — tracing has no fatal level.
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "debug" => "debug",
            "warn" => "warn",
            "error" | "fatal" => "error",
            _ => "info",
        }
    }
}

/// Errors raised while loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read {
        path: String,
        source: std::io::Error,
    },
    /// The config file is not valid JSON or is missing required fields.
    Parse(serde_json::Error),
    /// `cloud` does not start with `ws://` or `wss://`.
    InvalidCloudUrl(String),
    /// `logLevel` is not one of the recognized levels.
    InvalidLogLevel(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {path}: {source}")
            }
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
            ConfigError::InvalidCloudUrl(url) => {
                write!(f, "config field 'cloud' must be a ws:// or wss:// URL, got {url:?}")
            }
            ConfigError::InvalidLogLevel(level) => {
                write!(
                    f,
                    "config field 'logLevel' must be one of debug|info|warn|error|fatal, got {level:?}"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
