//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults (`MURMUR_HOST` / `MURMUR_PORT` seed host and port)
//! - TOML file (`MURMUR_CONFIG`, or the first of the standard paths)
//! - Environment variables (`MURMUR__SECTION__KEY`)

use anyhow::{ensure, Context, Result};
use murmur_core::{FileStore, HubConfig, MemoryStore, PersistenceStore};
use murmur_transport::PumpConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Paths searched when `MURMUR_CONFIG` is not set.
const CONFIG_PATHS: [&str; 3] = [
    "murmur.toml",
    "/etc/murmur/murmur.toml",
    "~/.config/murmur/murmur.toml",
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

    /// History and persistence.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
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
    /// Maximum number of simultaneously registered connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted inbound frame in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Message content is truncated to this many characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Per-connection outbound queue depth.
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Depth of the hub's command queue.
    #[serde(default = "default_queue_capacity")]
    pub ingress_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between keepalive pings in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Silence after which a peer is considered dead, in milliseconds.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Deadline for a single outbound write in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Backing store selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Bounded in-process store.
    Memory,
    /// Append-only JSON lines file.
    File,
    /// No persistence; joiners get no history.
    None,
}

/// History configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages replayed to a joiner.
    #[serde(default = "default_history_limit")]
    pub limit: usize,

    /// Which store to use.
    #[serde(default = "default_store")]
    pub store: StoreKind,

    /// File used by the `file` store.
    #[serde(default = "default_history_path")]
    pub path: String,

    /// Records kept by the `memory` store.
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Deadline for a single append or history query in milliseconds.
    #[serde(default = "default_persist_timeout")]
    pub persist_timeout_ms: u64,
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

// Default value functions
fn default_host() -> String {
    std::env::var("MURMUR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("MURMUR_PORT")
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

fn default_max_connections() -> usize {
    4
}

fn default_max_frame_size() -> usize {
    4096
}

fn default_max_content_length() -> usize {
    500
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    54_000 // 9/10 of the pong timeout
}

fn default_pong_timeout() -> u64 {
    60_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_history_limit() -> usize {
    50
}

fn default_store() -> StoreKind {
    StoreKind::Memory
}

fn default_history_path() -> String {
    "murmur-history.jsonl".to_string()
}

fn default_retention() -> usize {
    murmur_core::store::DEFAULT_RETENTION
}

fn default_persist_timeout() -> u64 {
    5_000
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
            history: HistoryConfig::default(),
            metrics: MetricsConfig::default(),
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
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_content_length: default_max_content_length(),
            outbound_queue_capacity: default_queue_capacity(),
            ingress_capacity: default_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_timeout_ms: default_pong_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_history_limit(),
            store: default_store(),
            path: default_history_path(),
            retention: default_retention(),
            persist_timeout_ms: default_persist_timeout(),
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
    /// Load configuration from file, environment and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source cannot be parsed or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        let path = match std::env::var("MURMUR_CONFIG") {
            Ok(path) => Some(shellexpand::tilde(&path).into_owned()),
            Err(_) => CONFIG_PATHS
                .iter()
                .map(|path| shellexpand::tilde(path).into_owned())
                .find(|path| Path::new(path).exists()),
        };

        if let Some(path) = &path {
            tracing::debug!(path = %path, "Using config file");
        }
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an optional file plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or parsed, or if the
    /// merged configuration is invalid.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MURMUR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.limits.max_connections > 0,
            "limits.max_connections must be at least 1"
        );
        ensure!(
            self.limits.outbound_queue_capacity > 0,
            "limits.outbound_queue_capacity must be at least 1"
        );
        ensure!(
            self.limits.max_content_length > 0,
            "limits.max_content_length must be at least 1"
        );
        ensure!(
            self.limits.ingress_capacity > 0,
            "limits.ingress_capacity must be at least 1"
        );
        ensure!(
            self.limits.max_frame_size >= self.limits.max_content_length,
            "limits.max_frame_size ({}) is smaller than limits.max_content_length ({})",
            self.limits.max_frame_size,
            self.limits.max_content_length
        );
        ensure!(
            self.heartbeat.ping_interval_ms < self.heartbeat.pong_timeout_ms,
            "heartbeat.ping_interval_ms ({}) must be below heartbeat.pong_timeout_ms ({})",
            self.heartbeat.ping_interval_ms,
            self.heartbeat.pong_timeout_ms
        );
        ensure!(
            self.history.limit < self.limits.outbound_queue_capacity,
            "history.limit ({}) must be below limits.outbound_queue_capacity ({})",
            self.history.limit,
            self.limits.outbound_queue_capacity
        );
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

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.limits.max_connections,
            history_limit: match self.history.store {
                StoreKind::None => 0,
                _ => self.history.limit,
            },
            ingress_capacity: self.limits.ingress_capacity,
            history_timeout: Duration::from_millis(self.history.persist_timeout_ms),
        }
    }

    /// Per-connection pump settings derived from this configuration.
    #[must_use]
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            max_frame_size: self.limits.max_frame_size,
            max_content_length: self.limits.max_content_length,
            pong_timeout: Duration::from_millis(self.heartbeat.pong_timeout_ms),
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            persist_timeout: Duration::from_millis(self.history.persist_timeout_ms),
        }
    }

    /// Build the configured persistence store, if any.
    #[must_use]
    pub fn build_store(&self) -> Option<Arc<dyn PersistenceStore>> {
        match self.history.store {
            StoreKind::Memory => Some(Arc::new(MemoryStore::with_retention(
                self.history.retention,
            ))),
            StoreKind::File => {
                let path = shellexpand::tilde(&self.history.path).into_owned();
                Some(Arc::new(FileStore::new(path)))
            }
            StoreKind::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_connections, 4);
        assert_eq!(config.limits.max_content_length, 500);
        assert_eq!(config.history.limit, 50);
        assert_eq!(config.history.store, StoreKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8080;
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 16

            [history]
            store = "file"
            path = "/tmp/chat.jsonl"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 16);
        assert_eq!(config.limits.max_frame_size, 4096);
        assert_eq!(config.history.store, StoreKind::File);
        assert_eq!(config.history.path, "/tmp/chat.jsonl");
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let mut config = Config::default();
        config.limits.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_content_length() {
        let mut config = Config::default();
        config.limits.max_content_length = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_content_length"));
    }

    #[test]
    fn test_validate_rejects_ping_after_timeout() {
        let mut config = Config::default();
        config.heartbeat.ping_interval_ms = config.heartbeat.pong_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_history_filling_queue() {
        let mut config = Config::default();
        config.history.limit = config.limits.outbound_queue_capacity;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_frame_below_content() {
        let mut config = Config::default();
        config.limits.max_frame_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        let pump = config.pump_config();
        assert_eq!(pump.ping_interval, Duration::from_secs(54));
        assert_eq!(pump.pong_timeout, Duration::from_secs(60));

        let hub = config.hub_config();
        assert_eq!(hub.max_connections, 4);
        assert_eq!(hub.history_limit, 50);
        assert_eq!(hub.history_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_no_store_disables_history() {
        let mut config = Config::default();
        config.history.store = StoreKind::None;
        assert!(config.build_store().is_none());
        assert_eq!(config.hub_config().history_limit, 0);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "murmur-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "port = 9100\n[history]\nlimit = 10\n").unwrap();

        let config = Config::load_from(path.to_str()).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.history.limit, 10);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_from_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!(
            "murmur-config-invalid-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[limits]\nmax_connections = 0\n").unwrap();

        assert!(Config::load_from(path.to_str()).is_err());

        std::fs::remove_file(&path).unwrap();
    }
}
