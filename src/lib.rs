//! Real-time market-data candle fan-out service.
//!
//! Streams one-minute OHLCV candles from an upstream pub/sub bus, rolls
//! them into a per-symbol window, derives any supported higher timeframe
//! on demand, and fans the current candle of every subscribed
//! `(symbol, interval)` out to connected WebSocket clients — throttled to
//! one update per second per subscription.

use anyhow::Result;

pub mod aggregator;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod history;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;
pub mod websocket;

pub use config::ServiceConfig;
pub use server::GatewayServer;

/// Build and run the service until shutdown.
pub async fn start_server(config: ServiceConfig) -> Result<()> {
    let server = GatewayServer::new(config).await?;
    server.start().await
}
