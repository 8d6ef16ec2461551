//! Candle gateway — main entry point.

use anyhow::Result;
use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use candle_gateway::{start_server, ServiceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "candle_gateway=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = Command::new("candle-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time candle fan-out gateway")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("candle-gateway.toml"),
        )
        .get_matches();

    let default_config = "candle-gateway.toml".to_string();
    let config_path = matches
        .get_one::<String>("config")
        .unwrap_or(&default_config);
    let config = match ServiceConfig::from_file(config_path) {
        Ok(config) => {
            info!("loaded configuration from: {config_path}");
            config
        }
        Err(err) => {
            info!(%err, "no usable config at {config_path}, using defaults");
            ServiceConfig::default()
        }
    };

    info!("starting candle gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("binding to: {}", config.server_address());
    info!("tracked symbols: {:?}", config.upstream.symbols);
    info!("metrics enabled: {}", config.monitoring.metrics_enabled);

    if let Err(err) = start_server(config).await {
        error!(%err, "fatal startup or runtime error");
        std::process::exit(1);
    }

    Ok(())
}
