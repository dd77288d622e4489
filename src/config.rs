//! Configuration module for the filepool server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Concurrency substrate used to run connection workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One OS process per in-flight connection.
    Process,
    /// A fixed set of OS threads sharing process memory.
    Thread,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Process => write!(f, "process"),
            BackendKind::Thread => write!(f, "thread"),
        }
    }
}

/// Command-line arguments for the file server
#[derive(Parser, Debug, Default)]
#[command(name = "filepool")]
#[command(author = "filepool authors")]
#[command(version = "0.1.0")]
#[command(about = "A pooled file-transfer server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind both listeners to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port for file operations
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port advertising the worker capacity
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Number of concurrent workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Worker backend
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Socket read chunk size in bytes
    #[arg(long)]
    pub read_buffer: Option<usize>,

    /// Directory holding the stored files
    #[arg(short, long)]
    pub root: Option<PathBuf>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Socket read chunk size in bytes
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            control_port: default_control_port(),
            workers: default_workers(),
            backend: default_backend(),
            read_buffer: default_read_buffer(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the stored files
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
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

fn default_port() -> u16 {
    6667
}

fn default_control_port() -> u16 {
    6668
}

fn default_workers() -> usize {
    10
}

fn default_backend() -> BackendKind {
    BackendKind::Thread
}

fn default_read_buffer() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_root() -> PathBuf {
    PathBuf::from("files")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub control_port: u16,
    pub pool: WorkerPoolConfig,
    pub read_buffer: usize,
    pub root: PathBuf,
    pub log_level: String,
}

/// Worker pool shape, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    capacity: u32,
    backend: BackendKind,
}

impl WorkerPoolConfig {
    /// Build a pool configuration, rejecting a zero or oversized capacity.
    pub fn new(capacity: usize, backend: BackendKind) -> Result<Self, ConfigError> {
        match u32::try_from(capacity) {
            Ok(capacity) if capacity > 0 => Ok(Self { capacity, backend }),
            _ => Err(ConfigError::Invalid(format!(
                "workers must be between 1 and {}, got {capacity}",
                u32::MAX
            ))),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge already-parsed CLI arguments with the TOML file they point at.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let pool = WorkerPoolConfig::new(
            cli.workers.unwrap_or(toml_config.server.workers),
            cli.backend.unwrap_or(toml_config.server.backend),
        )?;

        let read_buffer = cli.read_buffer.unwrap_or(toml_config.server.read_buffer);
        if read_buffer == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer must be non-zero".to_string(),
            ));
        }

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            control_port: cli
                .control_port
                .unwrap_or(toml_config.server.control_port),
            pool,
            read_buffer,
            root: cli.root.unwrap_or(toml_config.storage.root),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Address of the file operation listener.
    pub fn operation_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address of the capacity listener.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
