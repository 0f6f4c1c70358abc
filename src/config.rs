//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig as ServeConfig;
use crate::websocket::{GateConfig, SessionConfig, Whitelist};

/// Placeholder secret; the binary warns when it is still in use
pub const DEFAULT_JWT_SECRET: &str = "change-this-secret-key-in-production";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub whitelist: WhitelistConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

/// Relay session and handshake settings
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    #[serde(default = "default_ping_period")]
    pub ping_period_ms: u64,

    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    #[serde(default = "default_coalesce_frames")]
    pub coalesce_frames: bool,
}

fn default_handshake_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_ping_period() -> u64 {
    54_000 // 9/10 of pong wait
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_coalesce_frames() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            max_message_size: default_max_message_size(),
            send_queue_capacity: default_send_queue_capacity(),
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: default_ping_period(),
            write_wait_ms: default_write_wait(),
            coalesce_frames: default_coalesce_frames(),
        }
    }
}

/// Network origin whitelist
#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_allowed_networks")]
    pub allowed_networks: Vec<String>,
}

fn default_allowed_networks() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_networks: default_allowed_networks(),
        }
    }
}

/// Credential validation
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

fn default_jwt_secret() -> String {
    DEFAULT_JWT_SECRET.to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("pilot-relay").join("config.toml")),
            Some(PathBuf::from("/etc/pilot-relay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `PILOT_RELAY_*` overrides from `lookup`
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = lookup("PILOT_RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PILOT_RELAY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(origins) = lookup("PILOT_RELAY_ALLOWED_ORIGINS") {
            self.server.allowed_origins = split_list(&origins);
        }

        // Relay overrides
        if let Some(ms) = lookup("PILOT_RELAY_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.relay.handshake_timeout_ms = ms;
        }
        if let Some(size) = lookup("PILOT_RELAY_MAX_MESSAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.relay.max_message_size = size;
        }

        // Whitelist overrides
        if let Some(enabled) = lookup("PILOT_RELAY_ENABLE_IP_WHITELIST").and_then(|v| parse_bool(&v)) {
            self.whitelist.enabled = enabled;
        }
        if let Some(networks) = lookup("PILOT_RELAY_ALLOWED_NETWORKS") {
            self.whitelist.allowed_networks = split_list(&networks);
        }

        // Auth overrides
        if let Some(secret) = lookup("PILOT_RELAY_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }

        // Logging overrides
        if let Some(level) = lookup("PILOT_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("PILOT_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let relay = &self.relay;
        for (name, value) in [
            ("relay.ping_period_ms", relay.ping_period_ms),
            ("relay.pong_wait_ms", relay.pong_wait_ms),
            ("relay.write_wait_ms", relay.write_wait_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        if relay.ping_period_ms >= relay.pong_wait_ms {
            return Err(ConfigError::Invalid(format!(
                "relay.ping_period_ms ({}) must be less than relay.pong_wait_ms ({})",
                relay.ping_period_ms, relay.pong_wait_ms
            )));
        }
        if relay.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "relay.send_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if relay.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_message_size must be greater than 0".to_string(),
            ));
        }
        self.whitelist()?;
        Ok(())
    }

    /// Settings for the HTTP listener
    pub fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            allowed_origins: self.server.allowed_origins.clone(),
        }
    }

    /// Settings for the admission gate and its sessions
    pub fn gate_config(&self) -> GateConfig {
        let relay = &self.relay;
        GateConfig {
            handshake_timeout: Duration::from_millis(relay.handshake_timeout_ms),
            session: SessionConfig {
                send_queue_capacity: relay.send_queue_capacity,
                max_message_size: relay.max_message_size,
                pong_wait: Duration::from_millis(relay.pong_wait_ms),
                ping_period: Duration::from_millis(relay.ping_period_ms),
                write_wait: Duration::from_millis(relay.write_wait_ms),
                coalesce_frames: relay.coalesce_frames,
            },
        }
    }

    /// Parsed whitelist policy
    pub fn whitelist(&self) -> Result<Whitelist, ConfigError> {
        Whitelist::new(self.whitelist.enabled, &self.whitelist.allowed_networks)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Pilot Relay Configuration
#
# Environment variables override these settings:
# - PILOT_RELAY_HOST
# - PILOT_RELAY_PORT
# - PILOT_RELAY_ALLOWED_ORIGINS (comma separated)
# - PILOT_RELAY_HANDSHAKE_TIMEOUT_MS
# - PILOT_RELAY_MAX_MESSAGE_SIZE
# - PILOT_RELAY_ENABLE_IP_WHITELIST
# - PILOT_RELAY_ALLOWED_NETWORKS (comma separated CIDRs)
# - PILOT_RELAY_JWT_SECRET
# - PILOT_RELAY_LOG_LEVEL
# - PILOT_RELAY_LOG_FORMAT

[server]
# Server host
host = "0.0.0.0"

# Server port
port = 8080

# Allowed CORS origins ("*" allows any)
allowed_origins = ["*"]

[relay]
# Time a new connection has to answer the handshake (ms)
handshake_timeout_ms = 10000

# Largest inbound frame accepted (bytes); bigger frames close the connection
max_message_size = 65536

# Outbound messages buffered per connection before it is dropped as too slow
send_queue_capacity = 256

# Peer must answer a ping within this window (ms)
pong_wait_ms = 60000

# Keepalive ping interval (ms), must be below pong_wait_ms
ping_period_ms = 54000

# Deadline for a single write (ms)
write_wait_ms = 10000

# Send already-queued messages in one frame, newline separated
coalesce_frames = true

[whitelist]
# Only accept connections from the networks below
enabled = false

# Allowed networks in CIDR notation
allowed_networks = ["0.0.0.0/0"]

[auth]
# HS256 secret used to verify bearer tokens
jwt_secret = "change-this-secret-key-in-production"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
