//! Configuration loading for parley-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and field has a default, so an empty file is valid.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for parley-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Realtime (WebSocket) server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Credentials accepted on CONNECT.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Realtime server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Largest accepted frame in bytes (default: 1 MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Advertised client ping interval in milliseconds (default: 25000).
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Inbound silence in milliseconds after which a connection is dead (default: 60000).
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Seconds allowed between OPEN and a valid CONNECT (default: 10).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Outbound frames buffered per connection before dropping (default: 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Spacing between reconnect delays announced on shutdown (default: 250).
    #[serde(default = "default_shutdown_stagger_ms")]
    pub shutdown_stagger_ms: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Page size used when a sync request asks for 0 (default: 100).
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    /// Largest page a sync request may ask for (default: 500).
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

/// Presence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// TTL of presence records in seconds, refreshed by heartbeats (default: 90).
    #[serde(default = "default_presence_ttl_secs")]
    pub ttl_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum new connections per remote IP per minute (default: 30).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Maximum events per connection per minute (default: 120).
    #[serde(default = "default_events_per_minute")]
    pub events_per_minute: u32,
    /// Maximum events per second across all connections (default: 2000).
    #[serde(default = "default_global_events_per_second")]
    pub global_events_per_second: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:9090).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

/// Credentials per app.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Apps keyed by app id.
    #[serde(default)]
    pub apps: HashMap<String, AppCredentials>,
}

/// Credentials of one app.
#[derive(Debug, Clone, Deserialize)]
pub struct AppCredentials {
    /// Token end-user devices present on `/`.
    pub client_secret: String,
    /// Token operators present on `/admin` and the HTTP admin API.
    pub admin_token: String,
    /// Display names of operators keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, String>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_payload() -> usize {
    parley_types::DEFAULT_MAX_PAYLOAD
}

fn default_ping_interval_ms() -> u64 {
    25_000
}

fn default_ping_timeout_ms() -> u64 {
    60_000
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_outbound_queue() -> usize {
    256
}

fn default_shutdown_stagger_ms() -> u64 {
    250
}

fn default_database_path() -> PathBuf {
    PathBuf::from("parley.db")
}

fn default_page_size() -> u32 {
    100
}

fn default_max_page_size() -> u32 {
    500
}

fn default_presence_ttl_secs() -> u64 {
    90
}

fn default_connections_per_ip() -> u32 {
    30
}

fn default_events_per_minute() -> u32 {
    120
}

fn default_global_events_per_second() -> u32 {
    2000
}

fn default_http_bind() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_payload: default_max_payload(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            outbound_queue: default_outbound_queue(),
            shutdown_stagger_ms: default_shutdown_stagger_ms(),
        }
    }
}

impl ServerConfig {
    /// Inbound silence after which a connection is dead.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Time allowed for the CONNECT packet.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl_secs(),
        }
    }
}

impl PresenceConfig {
    /// TTL of presence records.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: default_connections_per_ip(),
            events_per_minute: default_events_per_minute(),
            global_events_per_second: default_global_events_per_second(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
