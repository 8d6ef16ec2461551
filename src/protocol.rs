//! Client/server wire protocol. Messages are JSON objects discriminated
//! on `type`, using the same tagged-enum shape as the rest of this
//! crate's websocket frames.

use crate::model::{Candle, Interval, Symbol};
use serde::{Deserialize, Serialize};

/// Default number of bars returned by `subscribe` when `initialBars` is
/// omitted.
pub const DEFAULT_INITIAL_BARS: u32 = 100;
/// Clamp range for `initialBars`.
pub const MIN_INITIAL_BARS: u32 = 1;
pub const MAX_INITIAL_BARS: u32 = 1000;

/// A message received from a client over the WebSocket connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        symbol: String,
        interval: String,
        #[serde(default, rename = "initialBars")]
        initial_bars: Option<u32>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { symbol: String, interval: String },
    #[serde(rename = "ping")]
    Ping {},
}

/// A message sent to a client over the WebSocket connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "initial")]
    Initial {
        symbol: Symbol,
        interval: Interval,
        bars: Vec<Candle>,
    },
    #[serde(rename = "update")]
    Update {
        symbol: Symbol,
        interval: Interval,
        bar: Candle,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong {},
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Clamp a client-supplied `initialBars` to `[MIN_INITIAL_BARS,
/// MAX_INITIAL_BARS]`, defaulting when absent. Never rejects input.
#[must_use]
pub fn clamp_initial_bars(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_INITIAL_BARS)
        .clamp(MIN_INITIAL_BARS, MAX_INITIAL_BARS)
}

/// Validate a subscribe/unsubscribe's `interval` field, producing a
/// reply that names every valid spelling.
pub fn validate_interval(raw: &str) -> Result<Interval, crate::error::ProtocolError> {
    Interval::parse(raw).ok_or_else(|| crate::error::ProtocolError::InvalidInterval {
        got: raw.to_string(),
        valid: Interval::valid_list(),
    })
}

/// Validate a subscribe/unsubscribe's `symbol` field against the allow-list.
pub fn validate_symbol(raw: &str) -> Result<Symbol, crate::error::ProtocolError> {
    Symbol::parse(raw).ok_or_else(|| crate::error::ProtocolError::InvalidSymbol {
        got: raw.to_string(),
        allowed: Symbol::allowed_list(),
    })
}
