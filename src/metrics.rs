//! Prometheus metrics for the candle gateway.
//!
//! Covers the counters/gauges worth exposing alongside the
//! `/health/ws-stats` JSON snapshot: session churn, room population,
//! broadcast throughput, and ingest health.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Gateway metrics collector.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    active_sessions: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::register_metrics();
        Self::default()
    }

    fn register_metrics() {
        describe_gauge!(
            "candle_gateway_active_sessions",
            "Number of live WebSocket sessions"
        );
        describe_gauge!(
            "candle_gateway_rooms_active",
            "Number of rooms currently registered"
        );
        describe_counter!(
            "candle_gateway_broadcast_ticks_total",
            "Total broadcaster dispatch ticks run"
        );
        describe_counter!(
            "candle_gateway_broadcast_send_failures_total",
            "Total outbound sends that failed (full or closed queue)"
        );
        describe_counter!(
            "candle_gateway_ingest_messages_total",
            "Total upstream candle messages processed"
        );
        describe_counter!(
            "candle_gateway_ingest_errors_total",
            "Total upstream candle messages dropped (malformed or out-of-order)"
        );
        describe_counter!(
            "candle_gateway_protocol_errors_total",
            "Total client messages rejected with a protocol error"
        );
    }

    pub fn record_session_opened(&self) {
        let active = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        #[allow(clippy::cast_precision_loss)]
        gauge!("candle_gateway_active_sessions").set(active as f64);
    }

    pub fn record_session_closed(&self) {
        let previous = self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        let active = previous.saturating_sub(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!("candle_gateway_active_sessions").set(active as f64);
    }

    pub fn record_rooms_active(&self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        gauge!("candle_gateway_rooms_active").set(count as f64);
    }

    pub fn record_broadcast_tick(&self) {
        counter!("candle_gateway_broadcast_ticks_total").increment(1);
    }

    pub fn record_broadcast_send_failure(&self) {
        counter!("candle_gateway_broadcast_send_failures_total").increment(1);
    }

    pub fn record_ingest_message(&self) {
        counter!("candle_gateway_ingest_messages_total").increment(1);
    }

    pub fn record_ingest_error(&self) {
        counter!("candle_gateway_ingest_errors_total").increment(1);
    }

    pub fn record_protocol_error(&self) {
        counter!("candle_gateway_protocol_errors_total").increment(1);
    }
}

/// Global metrics instance.
static METRICS: std::sync::OnceLock<GatewayMetrics> = std::sync::OnceLock::new();

/// Get the global metrics instance, initializing it on first access.
pub fn get_metrics() -> &'static GatewayMetrics {
    METRICS.get_or_init(GatewayMetrics::new)
}
