//! Configuration management for sigchat
//!
//! Defaults, environment overrides (`SIGCHAT_<SECTION>_<KEY>`), TOML files and
//! validation. Durations are written in humantime form (`3s`, `30s`).

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delivery server
    pub server: ServerConfig,

    /// Durable storage
    pub store: StoreConfig,

    /// Chat client
    pub client: ClientConfig,

    /// Logging
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Maximum concurrent WebSocket connections
    pub max_connections: usize,

    /// Frames buffered per connection before the writer applies backpressure
    pub outbound_buffer: usize,

    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; in-memory when unset
    pub database_path: Option<PathBuf>,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the delivery server
    pub server_url: String,

    /// Base URL for the HTTP API (public key lookups)
    pub api_url: String,

    /// Fixed delay between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Public key cache lifetime
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,

    /// Where conversations are persisted; in-memory when unset
    pub conversation_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3001)),
            max_connections: 10_000,
            outbound_buffer: 256,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3001/ws".to_string(),
            api_url: "http://127.0.0.1:3001".to_string(),
            reconnect_delay: Duration::from_secs(3),
            key_cache_ttl: crate::crypto::DEFAULT_KEY_TTL,
            conversation_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

fn env_error(var: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Env { var: var.to_string(), reason: reason.to_string() }
}

fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| env_error(name, e)),
        Err(_) => Ok(None),
    }
}

fn parse_duration_var(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| env_error(name, e)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Example: `SIGCHAT_SERVER_BIND_ADDRESS=0.0.0.0:3001`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay any `SIGCHAT_*` variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Server config
        if let Some(addr) = parse_var("SIGCHAT_SERVER_BIND_ADDRESS")? {
            self.server.bind_address = addr;
        }
        if let Some(max) = parse_var("SIGCHAT_SERVER_MAX_CONNECTIONS")? {
            self.server.max_connections = max;
        }
        if let Some(buffer) = parse_var("SIGCHAT_SERVER_OUTBOUND_BUFFER")? {
            self.server.outbound_buffer = buffer;
        }
        if let Some(timeout) =
            parse_duration_var("SIGCHAT_SERVER_SHUTDOWN_TIMEOUT")?
        {
            self.server.shutdown_timeout = timeout;
        }

        // Store config
        if let Ok(path) = env::var("SIGCHAT_STORE_DATABASE_PATH") {
            self.store.database_path = Some(PathBuf::from(path));
        }

        // Client config
        if let Ok(url) = env::var("SIGCHAT_CLIENT_SERVER_URL") {
            self.client.server_url = url;
        }
        if let Ok(url) = env::var("SIGCHAT_CLIENT_API_URL") {
            self.client.api_url = url;
        }
        if let Some(delay) =
            parse_duration_var("SIGCHAT_CLIENT_RECONNECT_DELAY")?
        {
            self.client.reconnect_delay = delay;
        }
        if let Some(ttl) = parse_duration_var("SIGCHAT_CLIENT_KEY_CACHE_TTL")? {
            self.client.key_cache_ttl = ttl;
        }
        if let Ok(dir) = env::var("SIGCHAT_CLIENT_CONVERSATION_DIR") {
            self.client.conversation_dir = Some(PathBuf::from(dir));
        }

        // Logging config
        if let Ok(level) = env::var("SIGCHAT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_var("SIGCHAT_LOG_JSON")? {
            self.logging.json_format = json;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.server.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be greater than 0".to_string(),
            ));
        }

        if !(self.client.server_url.starts_with("ws://")
            || self.client.server_url.starts_with("wss://"))
        {
            return Err(ConfigError::Invalid(format!(
                "server_url must be a ws:// or wss:// URL: {}",
                self.client.server_url
            )));
        }
        if !(self.client.api_url.starts_with("http://")
            || self.client.api_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "api_url must be an http:// or https:// URL: {}",
                self.client.api_url
            )));
        }
        if self.client.reconnect_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "reconnect_delay must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }
}
