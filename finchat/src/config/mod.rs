//! Configuration system for the `FinChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/finchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::BackoffPolicy;

/// Errors that can occur when loading configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    reconnect: ReconnectFileConfig,
    chat: ChatFileConfig,
    auth: AuthFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    pending_send_cap: Option<usize>,
    typing_timeout_secs: Option<u64>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    credentials_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnection and liveness configuration (used by the supervisor).
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff schedule for reconnection attempts.
    pub backoff: BackoffPolicy,
    /// Interval between liveness probes once connected. Two silent
    /// intervals in a row count as a dead connection.
    pub heartbeat_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Chat subsystem configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Maximum number of unacknowledged outbound messages held for resend.
    /// Beyond the cap the oldest is dropped and marked failed.
    pub pending_send_cap: usize,
    /// How long a remote typing indicator stays up without a follow-up.
    pub typing_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            pending_send_cap: 50,
            typing_timeout: Duration::from_secs(10),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// WebSocket URL of the chat backend (e.g. `ws://127.0.0.1:8000/ws/chat`).
    pub server_url: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the handshake acknowledgment after the socket opens.
    pub handshake_timeout: Duration,
    /// Channel capacity for the command/event channels.
    pub channel_capacity: usize,

    // -- Reconnect --
    /// Backoff and heartbeat settings.
    pub reconnect: ReconnectConfig,

    // -- Chat --
    /// Pending-send and typing settings.
    pub chat: ChatConfig,

    // -- Auth --
    /// Override for the credential file location.
    pub credentials_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            chat: ChatConfig::default(),
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/finchat/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli.server_url.clone().or_else(|| file.server.url.clone()),
            connect_timeout: file
                .server
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: file
                .server
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            channel_capacity: file
                .server
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectConfig {
                backoff: BackoffPolicy {
                    base_delay: file
                        .reconnect
                        .base_delay_ms
                        .map_or(defaults.reconnect.backoff.base_delay, Duration::from_millis),
                    max_delay: file
                        .reconnect
                        .max_delay_secs
                        .map_or(defaults.reconnect.backoff.max_delay, Duration::from_secs),
                },
                heartbeat_interval: file.reconnect.heartbeat_interval_secs.map_or(
                    defaults.reconnect.heartbeat_interval,
                    Duration::from_secs,
                ),
            },
            chat: ChatConfig {
                pending_send_cap: file
                    .chat
                    .pending_send_cap
                    .unwrap_or(defaults.chat.pending_send_cap),
                typing_timeout: file
                    .chat
                    .typing_timeout_secs
                    .map_or(defaults.chat.typing_timeout, Duration::from_secs),
            },
            credentials_path: cli
                .credentials_path
                .clone()
                .or_else(|| file.auth.credentials_path.clone().map(PathBuf::from)),
        }
    }
}

/// CLI arguments parsed by clap.
///
/// Environment variables are supported via `env` attributes so the client
/// can be configured without flags in scripted environments.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Chat client for the finchat assistant backend")]
pub struct CliArgs {
    /// WebSocket URL of the chat backend.
    #[arg(long, env = "FINCHAT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Session token to connect with (skips the stored credential file).
    #[arg(long, env = "FINCHAT_TOKEN")]
    pub token: Option<String>,

    /// User id to pair with `--token`.
    #[arg(long, env = "FINCHAT_USER")]
    pub user: Option<String>,

    /// Path to config file (default: `~/.config/finchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override for the credential file location.
    #[arg(long)]
    pub credentials_path: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "FINCHAT_LOG")]
    pub log_level: String,

    /// Path to a log file. When absent, logs go to stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available — use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("finchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
