//! History Adapter: the time-series store query plus the startup/lazy
//! warmup of the Aggregator. The store itself is an external
//! collaborator; this module owns only the glue between it and the
//! Aggregator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::Row;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::{Aggregator, MAX_1M};
use crate::error::TransientBackendError;
use crate::model::{Candle, Interval, Symbol};

/// Composes a raw store query with the Aggregator warmup behavior.
/// Implementations only need [`HistoryAdapter::raw_fetch`]; the warmup
/// and lazy-warm compositions are provided.
#[async_trait]
pub trait HistoryAdapter: Send + Sync {
    /// Query `limit` candles for `(symbol, interval)`, ascending by time,
    /// restricted to the last `limit × interval` horizon.
    async fn raw_fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, TransientBackendError>;

    /// One-time startup population of the Aggregator's 1m window for every
    /// tracked symbol. Failures are logged and non-fatal.
    async fn warmup(&self, aggregator: &Aggregator, symbols: &[Symbol]) {
        for symbol in symbols {
            match self.raw_fetch(symbol, Interval::OneMinute, MAX_1M).await {
                Ok(bars) => aggregator.initialize(symbol, bars),
                Err(err) => {
                    warn!(%symbol, %err, "warmup failed, continuing with an empty window");
                }
            }
        }
    }

    /// Serve a `subscribe`'s initial snapshot. If `interval` is not `1m`
    /// and the Aggregator's window for `symbol` is still empty, lazily
    /// warms it with `MAX_1M` 1m bars first before querying the store for
    /// the requested interval.
    async fn fetch(
        &self,
        aggregator: &Aggregator,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, TransientBackendError> {
        if interval != Interval::OneMinute && aggregator.window_len(symbol) == 0 {
            if let Ok(bars) = self.raw_fetch(symbol, Interval::OneMinute, MAX_1M).await {
                aggregator.initialize(symbol, bars);
            }
        }
        self.raw_fetch(symbol, interval, limit).await
    }
}

#[derive(Debug, Row, Deserialize)]
struct CandleRow {
    time_bucket: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: Option<f64>,
}

impl TryFrom<CandleRow> for Candle {
    type Error = TransientBackendError;

    fn try_from(row: CandleRow) -> Result<Self, Self::Error> {
        let time = chrono::DateTime::from_timestamp_millis(row.time_bucket)
            .ok_or_else(|| TransientBackendError::HistoryFetch("bad time_bucket".into()))?;
        Candle::new(
            time,
            Decimal::try_from(row.open).unwrap_or_default(),
            Decimal::try_from(row.high).unwrap_or_default(),
            Decimal::try_from(row.low).unwrap_or_default(),
            Decimal::try_from(row.close).unwrap_or_default(),
            Decimal::try_from(row.volume).unwrap_or_default(),
            row.quote_volume.and_then(|v| Decimal::try_from(v).ok()),
        )
        .map_err(|err| TransientBackendError::HistoryFetch(err.to_string()))
    }
}

/// ClickHouse-backed time-series store.
pub struct ClickHouseHistoryStore {
    client: clickhouse::Client,
    table: String,
}

impl ClickHouseHistoryStore {
    #[must_use]
    pub fn new(client: clickhouse::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl HistoryAdapter for ClickHouseHistoryStore {
    async fn raw_fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, TransientBackendError> {
        let query = format!(
            "SELECT toUnixTimestamp64Milli(time_bucket) AS time_bucket, open, high, low, close, \
             volume, quote_volume FROM {} WHERE symbol = ? AND interval = ? \
             ORDER BY time_bucket DESC LIMIT ?",
            self.table
        );
        let rows: Vec<CandleRow> = self
            .client
            .query(&query)
            .bind(symbol.as_str())
            .bind(interval.as_str())
            .bind(limit as u64)
            .fetch_all()
            .await
            .map_err(|err| TransientBackendError::HistoryFetch(err.to_string()))?;

        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(Candle::try_from)
            .collect::<Result<_, _>>()?;
        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }
}

/// In-memory store used by tests and local development — holds a fixed
/// ledger of candles per `(symbol, interval)` and slices the tail of it.
#[derive(Default)]
pub struct InMemoryHistoryAdapter {
    bars: parking_lot::Mutex<FxHashMap<(Symbol, Interval), Vec<Candle>>>,
}

impl InMemoryHistoryAdapter {
    pub fn seed(&self, symbol: &Symbol, interval: Interval, mut bars: Vec<Candle>) {
        bars.sort_by_key(|c| c.time);
        self.bars
            .lock()
            .insert((symbol.clone(), interval), bars);
    }

    /// Convenience for tests: always returns the current time as the last
    /// bar's close, so tests don't need to pin `Utc::now()`.
    #[must_use]
    pub fn now_floored(interval: Interval) -> chrono::DateTime<Utc> {
        interval.bar_start(Utc::now())
    }
}

#[async_trait]
impl HistoryAdapter for InMemoryHistoryAdapter {
    async fn raw_fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, TransientBackendError> {
        let bars = self.bars.lock();
        let candles = bars.get(&(symbol.clone(), interval)).cloned().unwrap_or_default();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }
}
