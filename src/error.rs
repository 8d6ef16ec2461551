//! Error taxonomy for the candle gateway core.
//!
//! Mirrors the four-way split of the design: protocol mistakes made by a
//! client, transient failures of an external collaborator, integrity
//! violations in ingested data, and fatal startup failures. Nothing below
//! this layer ever propagates across a session boundary — callers log and
//! reply locally instead of bubbling errors out of the core.

use thiserror::Error;

/// Malformed JSON, unknown `type`, missing fields, or an invalid `interval`
/// / `symbol` on an inbound client message. The session stays open; the
/// caller replies with a `ServerMessage::Error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid interval: {got}. Valid: {valid}")]
    InvalidInterval { got: String, valid: String },

    #[error("Invalid symbol: {got}. Only {allowed} is supported.")]
    InvalidSymbol { got: String, allowed: String },

    #[error("missing or malformed field: {0}")]
    MissingField(String),
}

/// A call into an external collaborator (history store or upstream feed)
/// failed or timed out. The triggering request gets an error reply; the
/// core keeps serving stale data and retries the collaborator on its own
/// schedule.
#[derive(Debug, Error)]
pub enum TransientBackendError {
    #[error("history fetch failed: {0}")]
    HistoryFetch(String),

    #[error("history fetch timed out after {0:?}")]
    HistoryTimeout(std::time::Duration),

    #[error("upstream feed error: {0}")]
    UpstreamFeed(String),
}

/// An out-of-order or otherwise malformed ingest candle. Always dropped and
/// logged; never surfaced to any client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("candle time {time} precedes window tail {tail}")]
    OutOfOrder { time: i64, tail: i64 },

    #[error("candle fails OHLCV invariants: {0}")]
    InvalidBar(String),
}

/// Irrecoverable startup failure. The process exits non-zero.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not reach history store for warmup within retry budget: {0}")]
    WarmupExhausted(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Umbrella error for call sites that need a single `Result` type (HTTP
/// handlers, the ingest loop). Session- and protocol-level call sites
/// should prefer the specific variant types above.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    TransientBackend(#[from] TransientBackendError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
