//! Configuration module for the getput server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Lowest port a user may ask the server to listen on.
pub const MIN_PORT: u16 = 1024;

/// Command-line arguments for the file server
#[derive(Parser, Debug)]
#[command(name = "getput")]
#[command(author = "getput authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol file server supporting GET and PUT", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on (1024 or above)
    #[arg(value_parser = clap::value_parser!(u16).range(MIN_PORT as i64..))]
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Interface address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Pending-connection queue length passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on live connection workers (unset = unlimited)
    pub max_workers: Option<usize>,
    /// Number of runtime threads (defaults to number of CPU cores)
    pub threads: Option<usize>,
    /// How long shutdown waits for live workers before cancelling them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            max_workers: None,
            threads: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_workers: Option<usize>,
    pub threads: Option<usize>,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    ///
    /// Invalid arguments make clap print usage to stderr and exit non-zero.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge already-parsed CLI args with the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: toml_config.server.host,
            port: cli.port,
            backlog: toml_config.server.backlog,
            max_workers: toml_config.server.max_workers,
            threads: toml_config.server.threads,
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max) = self.max_workers {
            if max == 0 || max > Semaphore::MAX_PERMITS {
                return Err(ConfigError::InvalidValue(
                    "server.max_workers",
                    format!("must be between 1 and {}, got {max}", Semaphore::MAX_PERMITS),
                ));
            }
        }
        if self.threads == Some(0) {
            return Err(ConfigError::InvalidValue(
                "server.threads",
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(key, reason) => {
                write!(f, "Invalid config value '{}': {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
