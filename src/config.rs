//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::server::{ServerOptions, DEFAULT_READ_BUFFER_SIZE};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "loopback-echo")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP echo server on 127.0.0.1", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long, allow_hyphen_values = true)]
    pub port: Option<String>,

    /// Listen backlog (defaults to the platform's SOMAXCONN)
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Suggested size of each read buffer in bytes
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Maximum number of buffers alive at once
    #[arg(long)]
    pub max_buffers: Option<usize>,

    /// Echo writes queued per connection before reading pauses
    #[arg(long)]
    pub max_pending_writes: Option<usize>,

    /// Readiness events fetched per poll
    #[arg(long)]
    pub event_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A port as written in the config file.
///
/// Kept loosely typed so that validation happens in one place, at start.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum PortValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl PortValue {
    fn into_text(self) -> String {
        match self {
            PortValue::Integer(n) => n.to_string(),
            PortValue::Float(f) => f.to_string(),
            PortValue::Text(s) => s,
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: PortValue,
    /// Listen backlog
    pub backlog: Option<i32>,
    /// Readiness events fetched per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            backlog: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Buffer-related configuration
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Suggested size of each read buffer
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    /// Maximum number of buffers alive at once
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    /// Maximum number of released buffers kept for reuse
    #[serde(default = "default_max_cached")]
    pub max_cached: usize,
    /// Echo writes queued per connection before reading pauses
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_size: default_read_size(),
            max_outstanding: default_max_outstanding(),
            max_cached: default_max_cached(),
            max_pending: default_max_pending(),
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

fn default_port() -> PortValue {
    PortValue::Integer(9001)
}

fn default_event_capacity() -> usize {
    ServerOptions::default().event_capacity
}

fn default_read_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_max_outstanding() -> usize {
    ServerOptions::default().max_buffers
}

fn default_max_cached() -> usize {
    ServerOptions::default().cached_buffers
}

fn default_max_pending() -> usize {
    ServerOptions::default().max_pending_writes
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port as given; validated by `Server::start_from_str`.
    pub port: String,
    pub options: ServerOptions,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args over file values.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            port: cli.port.unwrap_or_else(|| file.server.port.into_text()),
            options: ServerOptions {
                backlog: cli.backlog.or(file.server.backlog),
                read_buffer_size: cli.read_buffer_size.unwrap_or(file.buffers.read_size),
                max_buffers: cli.max_buffers.unwrap_or(file.buffers.max_outstanding),
                cached_buffers: file.buffers.max_cached,
                max_pending_writes: cli
                    .max_pending_writes
                    .unwrap_or(file.buffers.max_pending),
                event_capacity: cli.event_capacity.unwrap_or(file.server.event_capacity),
            },
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
