//! Configuration system for the relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tcpturn-server/config.toml`)
//! 4. Compiled defaults

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::server::ServerOptions;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The configured public IP is not an IP address.
    #[error("invalid public ip {0:?}")]
    InvalidPublicIp(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
    logging: LoggingFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    public_ip: Option<String>,
    idle_timeout_secs: Option<u64>,
    stats_interval_secs: Option<u64>,
}

/// `[logging]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LoggingFileConfig {
    log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "TCP TURN relay server")]
pub struct ServerCliArgs {
    /// Address the control server listens on.
    #[arg(short, long, env = "TCPTURN_BIND")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/tcpturn-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Public IP that relay listeners bind and advertise.
    #[arg(long, env = "TCPTURN_PUBLIC_IP")]
    pub public_ip: Option<String>,

    /// Seconds without a control frame before the connection is dropped.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Seconds between statistics log lines (0 disables them).
    #[arg(long)]
    pub stats_interval_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TCPTURN_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control server binds to (e.g., `0.0.0.0:3478`).
    pub bind_addr: String,
    /// Public IP for relay listeners; discovered at startup when unset.
    pub public_ip: Option<IpAddr>,
    /// Control connection reader idle timeout, in seconds.
    pub idle_timeout_secs: u64,
    /// Statistics log period in seconds; 0 disables it.
    pub stats_interval_secs: u64,
    /// Log level filter string.
    pub log_level: String,
    /// Log file path; `None` logs to stdout.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3478".to_string(),
            public_ip: None,
            idle_timeout_secs: 600,
            stats_interval_secs: 300,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the public IP does not parse.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: &ServerConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let public_ip = cli
            .public_ip
            .as_deref()
            .or(file.server.public_ip.as_deref())
            .map(|raw| {
                raw.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidPublicIp(raw.to_string()))
            })
            .transpose()?;

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            public_ip,
            idle_timeout_secs: cli
                .idle_timeout_secs
                .or(file.server.idle_timeout_secs)
                .unwrap_or(defaults.idle_timeout_secs),
            stats_interval_secs: cli
                .stats_interval_secs
                .or(file.server.stats_interval_secs)
                .unwrap_or(defaults.stats_interval_secs),
            log_level: cli.log_level.clone(),
            log_file: cli
                .log_file
                .clone()
                .or_else(|| file.logging.log_file.clone()),
        })
    }

    /// Control server options derived from this configuration.
    #[must_use]
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            stats_interval: (self.stats_interval_secs > 0)
                .then_some(Duration::from_secs(self.stats_interval_secs)),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the server.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("tcpturn-server").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
