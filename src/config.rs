//! Configuration for the candle gateway service.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Top-level service configuration, loadable from a TOML file with
/// `CANDLEGW_`-prefixed environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP/WebSocket server configuration.
    pub server: ServerConfig,
    /// Upstream pub/sub connection configuration.
    pub upstream: UpstreamConfig,
    /// Time-series store connection configuration.
    pub history: HistoryConfig,
    /// Broadcaster dispatch tuning.
    pub broadcast: BroadcastConfig,
    /// Session heartbeat tuning.
    pub heartbeat: HeartbeatConfig,
    /// CORS configuration.
    pub cors: CorsConfig,
    /// Monitoring configuration.
    pub monitoring: MonitoringConfig,
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub max_body_size: usize,
    pub compression: bool,
}

/// Upstream pub/sub connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub redis_url: String,
    pub symbols: Vec<String>,
}

/// Time-series store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub clickhouse_url: String,
    pub table: String,
    pub subscribe_timeout_seconds: u64,
}

/// Broadcaster dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub period_ms: u64,
}

/// Session heartbeat tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub period_seconds: u64,
}

/// CORS configuration for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
}

/// Monitoring and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub metrics_enabled: bool,
    pub metrics_path: String,
    pub health_path: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8090,
                timeout_seconds: 30,
                max_body_size: 1024 * 1024,
                compression: true,
            },
            upstream: UpstreamConfig {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                symbols: vec!["BTC/USDT".to_string()],
            },
            history: HistoryConfig {
                clickhouse_url: "http://127.0.0.1:8123".to_string(),
                table: "candles_1m".to_string(),
                subscribe_timeout_seconds: 10,
            },
            broadcast: BroadcastConfig { period_ms: 1_000 },
            heartbeat: HeartbeatConfig { period_seconds: 30 },
            cors: CorsConfig {
                enabled: true,
                allowed_origins: vec!["*".to_string()],
            },
            monitoring: MonitoringConfig {
                metrics_enabled: true,
                metrics_path: "/metrics".to_string(),
                health_path: "/health".to_string(),
            },
        }
    }
}

impl ServiceConfig {
    /// Load from `path`, layering `CANDLEGW_`-prefixed environment
    /// variables over the file (e.g. `CANDLEGW_SERVER__PORT=9000`).
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("CANDLEGW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
