//! Ingest Adapter: consumes the upstream candle pub/sub feed, feeds the
//! Aggregator, and signals the Broadcaster that a symbol's rooms may have
//! new data. Reconnect uses capped exponential backoff with jitter, the
//! usual shape for a long-lived upstream subscription.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::broadcaster::Broadcaster;
use crate::metrics::get_metrics;
use crate::model::{Candle, Symbol};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upstream pub/sub channel for `symbol`, e.g. `candles:BTC/USDT:1m`.
#[must_use]
pub fn channel_name(symbol: &Symbol) -> String {
    format!("candles:{}:1m", symbol.as_str())
}

/// Computes the next backoff delay, doubling from [`INITIAL_BACKOFF`] and
/// capping at [`MAX_BACKOFF`], with up to 20% jitter to avoid reconnect
/// thundering-herds against the upstream.
fn next_backoff(current: Duration) -> Duration {
    let doubled = current.saturating_mul(2).min(MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..=(doubled.as_millis() as u64 / 5).max(1));
    doubled + Duration::from_millis(jitter_ms)
}

/// Drives the subscribe-parse-ingest-refresh loop against a Redis-backed
/// upstream, reconnecting with backoff on transport failure.
pub struct RedisIngestService {
    client: redis::Client,
    symbols: Vec<Symbol>,
    aggregator: Arc<Aggregator>,
    broadcaster: Arc<Broadcaster>,
}

impl RedisIngestService {
    #[must_use]
    pub fn new(
        client: redis::Client,
        symbols: Vec<Symbol>,
        aggregator: Arc<Aggregator>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            client,
            symbols,
            aggregator,
            broadcaster,
        }
    }

    /// Run forever, reconnecting on any transport error. Intended to be
    /// spawned as its own task; never returns under normal operation.
    pub async fn run(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.run_once().await {
                Ok(()) => {
                    // `run_once` only returns on a clean stream close, which
                    // for a pub/sub connection still means a reconnect.
                    warn!("upstream pub/sub stream closed, reconnecting");
                }
                Err(err) => {
                    error!(%err, "upstream pub/sub connection failed, reconnecting");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        use futures_util::StreamExt;

        let connection = self.client.get_async_connection().await?;
        let mut pubsub = connection.into_pubsub();
        for symbol in &self.symbols {
            pubsub.subscribe(channel_name(symbol)).await?;
        }
        info!(channels = self.symbols.len(), "subscribed to upstream candle channels");

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = message.get_payload()?;
            let channel = message.get_channel_name();
            let Some(symbol) = symbol_from_channel(channel) else {
                warn!(channel, "upstream message on unrecognized channel, discarding");
                continue;
            };

            match serde_json::from_str::<Candle>(&payload) {
                Ok(candle) => {
                    if let Err(err) = self.aggregator.ingest(&symbol, candle) {
                        warn!(%symbol, %err, "dropping out-of-order candle");
                        get_metrics().record_ingest_error();
                        continue;
                    }
                    get_metrics().record_ingest_message();
                    self.broadcaster.refresh(&self.aggregator, &symbol);
                }
                Err(err) => {
                    warn!(%symbol, %err, "dropping malformed candle payload");
                    get_metrics().record_ingest_error();
                }
            }
        }

        Ok(())
    }
}

fn symbol_from_channel(channel: &str) -> Option<Symbol> {
    let raw = channel.strip_prefix("candles:")?.strip_suffix(":1m")?;
    Symbol::parse(raw)
}
