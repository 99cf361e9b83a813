//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BACKBEAT_*)
//! - TOML configuration file

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use backbeat_core::{ConnectionConfig, HubConfig, PresenceConfig, RateLimitConfig};
use backbeat_protocol::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence tracking configuration.
    #[serde(default)]
    pub presence: PresenceSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for HS256 token verification.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Outbound queue depth per connection.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Per-connection inbound rate limit.
    #[serde(default)]
    pub rate: RateLimitConfig,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between server pings.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Seconds of inbound silence before the connection is dropped.
    #[serde(default = "default_read_window")]
    pub read_window_secs: u64,

    /// Seconds a single outbound write may take before the connection
    /// is dropped.
    #[serde(default = "default_write_deadline")]
    pub write_deadline_secs: u64,
}

/// Presence tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Seconds of inactivity before a user is swept offline.
    #[serde(default = "default_presence_timeout")]
    pub timeout_secs: u64,

    /// Seconds between sweeper passes.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum followers notified per presence change.
    #[serde(default = "default_fanout_limit")]
    pub follower_fanout_limit: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("BACKBEAT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BACKBEAT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_jwt_secret() -> String {
    std::env::var("BACKBEAT_JWT_SECRET").unwrap_or_else(|_| "backbeat-dev-secret".to_string())
}

fn default_true() -> bool {
    true
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_SIZE
}

fn default_queue_size() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    54
}

fn default_read_window() -> u64 {
    60
}

fn default_write_deadline() -> u64 {
    10
}

fn default_presence_timeout() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_fanout_limit() -> usize {
    1_000
}

fn default_metrics_port() -> u16 {
    std::env::var("BACKBEAT_METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9090)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            queue_size: default_queue_size(),
            rate: RateLimitConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            read_window_secs: default_read_window(),
            write_deadline_secs: default_write_deadline(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_presence_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            follower_fanout_limit: default_fanout_limit(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `$BACKBEAT_CONFIG` wins when set; otherwise the usual paths are
    /// tried in order and a missing file falls back to defaults with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("BACKBEAT_CONFIG") {
            return Self::from_file(&path);
        }

        let config_paths = [
            "backbeat.toml",
            "~/.config/backbeat/config.toml",
            "/etc/backbeat/config.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .expect("Invalid host:port")
    }

    /// Hub configuration derived from the limits and heartbeat sections.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            connection: ConnectionConfig {
                write_deadline: Duration::from_secs(self.heartbeat.write_deadline_secs),
                read_window: Duration::from_secs(self.heartbeat.read_window_secs),
                heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs),
                send_queue_size: self.limits.queue_size,
            },
            rate_limit: self.limits.rate,
        }
    }

    /// Presence tracker configuration.
    #[must_use]
    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            timeout: Duration::from_secs(self.presence.timeout_secs),
            sweep_interval: Duration::from_secs(self.presence.sweep_interval_secs),
            follower_fanout_limit: self.presence.follower_fanout_limit,
        }
    }
}
