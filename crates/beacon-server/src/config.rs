//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`BEACON_CONFIG`, or the first of the default paths found)
//! - Environment overrides (`BEACON__PORT`, `BEACON__LIMITS__OUTBOX_CAPACITY`, ...)
//! - `BEACON_HOST` / `BEACON_PORT` as defaults when the file sets neither

use anyhow::{Context, Result};
use beacon_core::RouteGeometry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Durable store writer configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Route geometry served to passenger apps.
    #[serde(default)]
    pub routes: Vec<RouteGeometry>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum route topics one connection may join.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Events buffered per connection before new ones are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// A peer silent for this long is treated as disconnected.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Durable store writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Writes queued before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_subscriptions() -> usize {
    16
}

fn default_max_message_size() -> usize {
    16 * 1024
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_queue_capacity() -> usize {
    beacon_core::writer::DEFAULT_QUEUE_CAPACITY
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
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
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("BEACON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read environment overrides")?;
        config.apply_overrides(&env)?;

        Ok(config)
    }

    fn find_file() -> Option<String> {
        if let Ok(path) = std::env::var("BEACON_CONFIG") {
            return Some(shellexpand::tilde(&path).into_owned());
        }
        CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists())
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

    /// Apply scalar overrides from a layered source.
    ///
    /// Keys are the lowercase dotted field paths (`limits.outbox_capacity`).
    /// Route geometry is only read from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if a present key cannot be converted.
    pub fn apply_overrides(&mut self, source: &config::Config) -> Result<()> {
        override_field(source, "host", &mut self.host)?;
        override_field(source, "port", &mut self.port)?;
        override_field(
            source,
            "transport.websocket_path",
            &mut self.transport.websocket_path,
        )?;
        override_field(
            source,
            "limits.max_subscriptions_per_connection",
            &mut self.limits.max_subscriptions_per_connection,
        )?;
        override_field(
            source,
            "limits.max_message_size",
            &mut self.limits.max_message_size,
        )?;
        override_field(
            source,
            "limits.outbox_capacity",
            &mut self.limits.outbox_capacity,
        )?;
        override_field(source, "heartbeat.interval_ms", &mut self.heartbeat.interval_ms)?;
        override_field(source, "heartbeat.timeout_ms", &mut self.heartbeat.timeout_ms)?;
        override_field(
            source,
            "store.queue_capacity",
            &mut self.store.queue_capacity,
        )?;
        override_field(source, "metrics.enabled", &mut self.metrics.enabled)?;
        override_field(source, "metrics.port", &mut self.metrics.port)?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

fn override_field<T: DeserializeOwned>(
    source: &config::Config,
    key: &str,
    slot: &mut T,
) -> Result<()> {
    match source.get::<T>(key) {
        Ok(value) => {
            *slot = value;
            Ok(())
        }
        Err(config::ConfigError::NotFound(_)) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Invalid override for {key}")),
    }
}
