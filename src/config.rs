//! Configuration module for kv-harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::connection::Target;
use crate::scenario::{Scenario, DEFAULT_FAN_OUT};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "kv-harness")]
#[command(author = "kv-harness authors")]
#[command(version = "0.1.0")]
#[command(about = "Test and load harness for a line-based key-value server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address to test (e.g., 127.0.0.1:6379)
    #[arg(short, long, global = true)]
    pub target: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// Harness subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Run protocol scenarios against the target
    Scenarios {
        /// Run a single scenario by name
        #[arg(long)]
        only: Option<Scenario>,

        /// Connections used by the fan-out scenario
        #[arg(long)]
        fan_out: Option<usize>,
    },

    /// Open many connections and issue SET commands on each
    Load {
        /// Number of concurrent connections
        #[arg(short = 'n', long)]
        connections: Option<usize>,

        /// SET commands per connection
        #[arg(short, long)]
        requests: Option<usize>,
    },

    /// Run the reference key-value server
    Serve {
        /// Address to bind to
        #[arg(short, long)]
        listen: Option<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub scenarios: ScenarioConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target server configuration
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    /// Address of the server under test
    #[serde(default = "default_address")]
    pub address: String,
    /// Connect timeout in milliseconds (0 = no timeout)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Scenario configuration
#[derive(Debug, Deserialize)]
pub struct ScenarioConfig {
    /// Connections used by the fan-out scenario
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
        }
    }
}

/// Load run configuration
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    /// Number of concurrent connections
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// SET commands per connection
    #[serde(default = "default_requests")]
    pub requests_per_connection: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            requests_per_connection: default_requests(),
        }
    }
}

/// Reference server configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_address")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_address(),
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

fn default_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_fan_out() -> usize {
    DEFAULT_FAN_OUT
}

fn default_connections() -> usize {
    100
}

fn default_requests() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary should do, with every setting resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Scenarios {
        only: Option<Scenario>,
        fan_out: usize,
    },
    Load {
        connections: usize,
        requests: usize,
    },
    Serve {
        listen: String,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub target: String,
    pub connect_timeout: Option<Duration>,
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mode = match cli.command {
            CliCommand::Scenarios { only, fan_out } => Mode::Scenarios {
                only,
                fan_out: fan_out.unwrap_or(toml_config.scenarios.fan_out),
            },
            CliCommand::Load {
                connections,
                requests,
            } => Mode::Load {
                connections: connections.unwrap_or(toml_config.load.connections),
                requests: requests.unwrap_or(toml_config.load.requests_per_connection),
            },
            CliCommand::Serve { listen } => Mode::Serve {
                listen: listen.unwrap_or(toml_config.server.listen),
            },
        };

        let connect_timeout = match toml_config.target.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Config {
            target: cli.target.unwrap_or(toml_config.target.address),
            connect_timeout,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            mode,
        }
    }

    /// Connection target built from the resolved settings.
    pub fn target(&self) -> Target {
        let target = Target::new(self.target.clone());
        match self.connect_timeout {
            Some(timeout) => target.with_connect_timeout(timeout),
            None => target,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
