//! Candle Aggregator: rolling window of 1-minute candles per symbol, and
//! the pure derivation of any supported timeframe from that window.
//! Built around whole-bar ingest from an upstream feed that already
//! emits 1m candles, rather than incremental per-trade building.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::error::IntegrityError;
use crate::model::{Candle, Interval, Symbol};

/// Maximum number of 1-minute candles retained per symbol.
pub const MAX_1M: usize = 1440;

/// Rolling per-symbol window of 1-minute candles plus the derivation of
/// higher-timeframe candles on demand.
///
/// Every public method locks the window internally and returns before
/// releasing it; there are no `.await` points anywhere in this type —
/// this type is pure in-memory state and must not block.
pub struct Aggregator {
    windows: parking_lot::Mutex<FxHashMap<Symbol, VecDeque<Candle>>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: parking_lot::Mutex::new(FxHashMap::default()),
        }
    }

    /// Ingest a single 1-minute candle for `symbol`. Overwrites the tail if
    /// `candle.time` matches it; otherwise appends, evicting the head once
    /// the window exceeds [`MAX_1M`]. Rejects strictly-out-of-order input.
    pub fn ingest(&self, symbol: &Symbol, candle: Candle) -> Result<(), IntegrityError> {
        let mut windows = self.windows.lock();
        let window = windows.entry(symbol.clone()).or_default();

        if let Some(tail) = window.back() {
            if candle.time < tail.time {
                return Err(IntegrityError::OutOfOrder {
                    time: candle.time.timestamp_millis(),
                    tail: tail.time.timestamp_millis(),
                });
            }
            if candle.time == tail.time {
                *window.back_mut().expect("checked non-empty above") = candle;
                return Ok(());
            }
        }

        window.push_back(candle);
        while window.len() > MAX_1M {
            window.pop_front();
        }
        Ok(())
    }

    /// Replace `symbol`'s window with the sorted-by-time tail of `candles`,
    /// truncated to the last [`MAX_1M`] entries. Idempotent with respect to
    /// content.
    pub fn initialize(&self, symbol: &Symbol, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.time);
        let start = candles.len().saturating_sub(MAX_1M);
        let window: VecDeque<Candle> = candles.into_iter().skip(start).collect();

        let mut windows = self.windows.lock();
        windows.insert(symbol.clone(), window);
    }

    /// Aggregate the candle for the bar containing "now", for `interval`.
    /// Returns `None` if the window holds no candles in that bar.
    #[must_use]
    pub fn current(&self, symbol: &Symbol, interval: Interval) -> Option<Candle> {
        let now = Utc::now();
        self.at(symbol, interval, now)
    }

    /// Aggregate the candle for the bar containing `at`, for `interval`.
    /// Exposed separately from [`Aggregator::current`] so tests can pin the
    /// reference instant instead of racing the wall clock.
    #[must_use]
    pub fn at(&self, symbol: &Symbol, interval: Interval, at: DateTime<Utc>) -> Option<Candle> {
        let windows = self.windows.lock();
        let window = windows.get(symbol)?;

        let bar_start = interval.bar_start(at);
        let bar_end_ms = bar_start.timestamp_millis() + interval.duration_ms();

        if interval == Interval::OneMinute {
            return window.back().filter(|c| c.time == bar_start).copied();
        }

        let contributors: Vec<&Candle> = window
            .iter()
            .filter(|c| {
                let ms = c.time.timestamp_millis();
                ms >= bar_start.timestamp_millis() && ms < bar_end_ms
            })
            .collect();

        merge_bar(bar_start, &contributors)
    }

    /// Read-only snapshot of `symbol`'s 1m window, oldest first.
    #[must_use]
    pub fn window(&self, symbol: &Symbol) -> Vec<Candle> {
        self.windows
            .lock()
            .get(symbol)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Length of `symbol`'s 1m window — used by stats/health reporting.
    #[must_use]
    pub fn window_len(&self, symbol: &Symbol) -> usize {
        self.windows.lock().get(symbol).map_or(0, VecDeque::len)
    }
}

/// Combine the 1m candles contributing to one higher-timeframe bar into a
/// single aggregate: open = earliest open, close = latest close, high/low
/// = extrema, volume/quoteVolume = sums with absent contributors treated
/// as 0 unless *every* contributor is absent.
fn merge_bar(bar_start: DateTime<Utc>, contributors: &[&Candle]) -> Option<Candle> {
    let (first, last) = (*contributors.first()?, *contributors.last()?);

    let high = contributors.iter().map(|c| c.high).max()?;
    let low = contributors.iter().map(|c| c.low).min()?;
    let volume: Decimal = contributors.iter().map(|c| c.volume).sum();

    let any_quote_volume = contributors.iter().any(|c| c.quote_volume.is_some());
    let quote_volume = any_quote_volume.then(|| {
        contributors
            .iter()
            .map(|c| c.quote_volume.unwrap_or(Decimal::ZERO))
            .sum()
    });

    Some(Candle {
        time: bar_start,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        quote_volume,
    })
}

/// Current wall-clock time as milliseconds since the Unix epoch. Used by
/// the broadcaster for `lastBroadcastAt` bookkeeping, not by the
/// Aggregator itself (which is always given `at` explicitly in tests).
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}
