//! Candle gateway server wiring: HTTP surface, WebSocket upgrade route,
//! and the background tasks (dispatch loop, heartbeat sweep, ingest) that
//! make the service live.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::broadcaster::{spawn_dispatch_loop, Broadcaster};
use crate::config::ServiceConfig;
use crate::error::FatalError;
use crate::history::{ClickHouseHistoryStore, HistoryAdapter};
use crate::ingest::RedisIngestService;
use crate::model::Symbol;
use crate::session::{spawn_heartbeat_loop, SessionManager};
use crate::stats;

/// Shared application state handed to every HTTP/WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub sessions: Arc<SessionManager>,
    pub history: Arc<dyn HistoryAdapter>,
    pub tracked_symbols: Arc<Vec<Symbol>>,
    pub prometheus: Option<PrometheusHandle>,
    pub start_time: Instant,
}

/// Owns configuration and drives startup/shutdown of the whole service.
pub struct GatewayServer {
    config: ServiceConfig,
    state: AppState,
}

impl GatewayServer {
    /// Build the service: parse the tracked symbol list, connect the
    /// history store, warm the Aggregator, and wire up shared state.
    /// Failure to warm is non-fatal; failure to parse a configured symbol
    /// is fatal, since it means the config is wrong.
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let tracked_symbols: Vec<Symbol> = config
            .upstream
            .symbols
            .iter()
            .map(|raw| {
                Symbol::parse(raw).ok_or_else(|| {
                    FatalError::Config(format!(
                        "configured symbol '{raw}' is not in the allow-list ({})",
                        Symbol::allowed_list()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let aggregator = Arc::new(Aggregator::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let sessions = Arc::new(SessionManager::new());

        let clickhouse = clickhouse::Client::default().with_url(&config.history.clickhouse_url);
        let history: Arc<dyn HistoryAdapter> = Arc::new(ClickHouseHistoryStore::new(
            clickhouse,
            config.history.table.clone(),
        ));

        info!("warming aggregator window from history store");
        history.warmup(&aggregator, &tracked_symbols).await;

        let prometheus = if config.monitoring.metrics_enabled {
            match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(%err, "failed to install prometheus recorder, /metrics will be empty");
                    None
                }
            }
        } else {
            None
        };

        let state = AppState {
            aggregator,
            broadcaster,
            sessions,
            history,
            tracked_symbols: Arc::new(tracked_symbols),
            prometheus,
            start_time: Instant::now(),
        };

        Ok(Self { config, state })
    }

    /// Run the service until shutdown: spawn the ingest adapter, the
    /// broadcaster dispatch loop, and the heartbeat sweep, then serve HTTP
    /// until `ctrl_c` or `SIGTERM`.
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server_address()
            .parse()
            .map_err(|err| FatalError::Config(format!("invalid server address: {err}")))?;

        let redis_client = redis::Client::open(self.config.upstream.redis_url.clone())?;
        let ingest = Arc::new(RedisIngestService::new(
            redis_client,
            self.state.tracked_symbols.as_ref().clone(),
            Arc::clone(&self.state.aggregator),
            Arc::clone(&self.state.broadcaster),
        ));
        let ingest_task = tokio::spawn(async move { ingest.run().await });
        let dispatch_task = spawn_dispatch_loop(Arc::clone(&self.state.broadcaster));
        let heartbeat_task = spawn_heartbeat_loop(
            Arc::clone(&self.state.sessions),
            Arc::clone(&self.state.broadcaster),
        );

        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
            FatalError::Bind {
                addr: addr.to_string(),
                source: err,
            }
        })?;
        info!("candle gateway listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("shutting down background tasks");
        ingest_task.abort();
        dispatch_task.abort();
        heartbeat_task.abort();
        Ok(())
    }

    fn build_router(self) -> Router {
        let cors = if self.config.cors.enabled {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        };

        Router::new()
            .route("/", get(crate::websocket::handle_upgrade))
            .route(&self.config.monitoring.health_path, get(health))
            .route("/health/ws-stats", get(ws_stats))
            .route(&self.config.monitoring.metrics_path, get(metrics))
            .with_state(self.state)
            .layer(DefaultBodyLimit::max(self.config.server.max_body_size))
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.server.timeout_seconds,
            )))
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(cors)
    }
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let active_sessions = state.sessions.count();
    let status = "OK";
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "services": {
                "sessions": active_sessions,
                "uptime_seconds": state.start_time.elapsed().as_secs(),
            }
        })),
    )
}

async fn ws_stats(State(state): State<AppState>) -> Json<stats::WsStats> {
    Json(stats::snapshot(
        &state.sessions,
        &state.broadcaster,
        &state.aggregator,
        &state.tracked_symbols,
    ))
}

async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

/// Waits for `ctrl_c` (or `SIGTERM` on unix). Used to drive graceful
/// shutdown — axum's graceful shutdown plus the task aborts above bound
/// how long that takes in practice.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
}
