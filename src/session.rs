//! Subscription Protocol & Session Manager: per-connection lifecycle —
//! accept, validate, fetch initial history, subscribe/unsubscribe,
//! heartbeat, terminate. Liveness/subscription bookkeeping follows the
//! same split-task, channel-per-connection shape used for the raw socket
//! handling, generalized onto a room-set model of subscriptions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::broadcaster::{Broadcaster, SessionId, Subscription};
use crate::error::ProtocolError;
use crate::history::HistoryAdapter;
use crate::metrics::get_metrics;
use crate::protocol::{clamp_initial_bars, validate_interval, validate_symbol, ClientMessage, ServerMessage};

/// Heartbeat sweep period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
/// Bound on the history fetch a `subscribe` handler will wait for before
/// replying with an error.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection state owned by the Session Manager. Referenced from room
/// sets by id only; mutable state (liveness, subscriptions) lives here.
pub struct SessionHandle {
    pub id: SessionId,
    alive: AtomicBool,
    terminate_requested: AtomicBool,
    pub terminate_signal: Notify,
    subscriptions: parking_lot::Mutex<HashSet<Subscription>>,
    outbound: mpsc::Sender<Message>,
}

impl SessionHandle {
    fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alive: AtomicBool::new(true),
            terminate_requested: AtomicBool::new(false),
            terminate_signal: Notify::new(),
            subscriptions: parking_lot::Mutex::new(HashSet::new()),
            outbound,
        }
    }

    /// Mark the session alive — called on `ping`, application-level or
    /// transport-level Pong.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    fn clear_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Best-effort, non-blocking reply. A full or closed queue is dropped
    /// silently; the connection's own health is tracked by the heartbeat,
    /// not by this send succeeding.
    pub fn send(&self, message: &ServerMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let _ = self.outbound.try_send(Message::Text(text));
    }

    pub fn send_ping(&self) {
        let _ = self.outbound.try_send(Message::Ping(Vec::new()));
    }

    fn request_termination(&self) {
        self.terminate_requested.store(true, Ordering::Relaxed);
        self.terminate_signal.notify_waiters();
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminate_requested.load(Ordering::Relaxed)
    }
}

/// Owns every live session and drives the subscribe/unsubscribe/ping
/// protocol against the Aggregator, Broadcaster, and History Adapter.
pub struct SessionManager {
    sessions: parking_lot::Mutex<FxHashMap<SessionId, Arc<SessionHandle>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: parking_lot::Mutex::new(FxHashMap::default()),
        }
    }

    /// Accept a new connection: assign an id, set liveness true, and
    /// initialize an empty room set.
    pub fn register(&self, outbound: mpsc::Sender<Message>) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(outbound));
        self.sessions.lock().insert(handle.id, Arc::clone(&handle));
        handle
    }

    /// Drop `session` from the manager. Does not by itself leave rooms —
    /// callers invoke `Broadcaster::leave_all` as part of close handling.
    pub fn remove(&self, session: SessionId) {
        self.sessions.lock().remove(&session);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// One heartbeat sweep: sessions whose liveness flag was already false
    /// are terminated and dropped from room membership; everyone else has
    /// their flag cleared and receives a Ping.
    pub fn sweep_heartbeats(&self, broadcaster: &Broadcaster) {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.lock().values().cloned().collect();
        for handle in handles {
            let was_alive = handle.clear_alive();
            if !was_alive {
                debug!(session = %handle.id, "heartbeat timeout, terminating session");
                handle.request_termination();
                broadcaster.leave_all(handle.id);
                self.remove(handle.id);
            } else {
                handle.send_ping();
            }
        }
    }

    /// Parse and dispatch one inbound text frame. Parse or schema failures
    /// become an `error` reply; the session stays open.
    pub async fn handle_text(
        &self,
        session: &SessionHandle,
        aggregator: &Aggregator,
        broadcaster: &Broadcaster,
        history: &Arc<dyn HistoryAdapter>,
        text: &str,
    ) {
        session.mark_alive();

        let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                get_metrics().record_protocol_error();
                session.send(&ServerMessage::error(
                    ProtocolError::InvalidJson(err.to_string()).to_string(),
                ));
                return;
            }
        };

        match message {
            ClientMessage::Subscribe {
                symbol,
                interval,
                initial_bars,
            } => {
                self.handle_subscribe(
                    session,
                    aggregator,
                    broadcaster,
                    history,
                    &symbol,
                    &interval,
                    initial_bars,
                )
                .await;
            }
            ClientMessage::Unsubscribe { symbol, interval } => {
                self.handle_unsubscribe(session, broadcaster, &symbol, &interval);
            }
            ClientMessage::Ping {} => {
                session.send(&ServerMessage::Pong {});
            }
        }
    }

    async fn handle_subscribe(
        &self,
        session: &SessionHandle,
        aggregator: &Aggregator,
        broadcaster: &Broadcaster,
        history: &Arc<dyn HistoryAdapter>,
        raw_symbol: &str,
        raw_interval: &str,
        initial_bars: Option<u32>,
    ) {
        let interval = match validate_interval(raw_interval) {
            Ok(interval) => interval,
            Err(err) => {
                get_metrics().record_protocol_error();
                session.send(&ServerMessage::error(err.to_string()));
                return;
            }
        };
        let symbol = match validate_symbol(raw_symbol) {
            Ok(symbol) => symbol,
            Err(err) => {
                get_metrics().record_protocol_error();
                session.send(&ServerMessage::error(err.to_string()));
                return;
            }
        };
        let limit = clamp_initial_bars(initial_bars);

        let sub = Subscription::new(symbol.clone(), interval);
        broadcaster.join(session.id, session.sender(), sub.clone());
        session.subscriptions.lock().insert(sub);
        // Prime the room's cached candle immediately so the next dispatch
        // tick has something to send without waiting on the next ingest.
        broadcaster.refresh(aggregator, &symbol);

        let fetch = history.fetch(aggregator, &symbol, interval, limit as usize);
        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, fetch).await {
            Ok(Ok(bars)) => {
                session.send(&ServerMessage::Initial {
                    symbol,
                    interval,
                    bars,
                });
            }
            Ok(Err(err)) => {
                warn!(%err, "history fetch failed during subscribe");
                session.send(&ServerMessage::error("Failed to subscribe to candles"));
            }
            Err(_) => {
                warn!("history fetch timed out during subscribe");
                session.send(&ServerMessage::error("Failed to subscribe to candles"));
            }
        }
    }

    fn handle_unsubscribe(
        &self,
        session: &SessionHandle,
        broadcaster: &Broadcaster,
        raw_symbol: &str,
        raw_interval: &str,
    ) {
        let (Ok(interval), Ok(symbol)) = (validate_interval(raw_interval), validate_symbol(raw_symbol)) else {
            return;
        };
        let sub = Subscription::new(symbol, interval);
        broadcaster.leave(session.id, &sub);
        session.subscriptions.lock().remove(&sub);
    }

    /// Close handling for transport `close`/`error`: drop all room
    /// memberships and forget the session.
    pub fn handle_disconnect(&self, session: &SessionHandle, broadcaster: &Broadcaster) {
        broadcaster.leave_all(session.id);
        self.remove(session.id);
    }
}

impl SessionHandle {
    fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }
}

/// Spawn the recurring 30-second heartbeat sweep.
pub fn spawn_heartbeat_loop(
    sessions: Arc<SessionManager>,
    broadcaster: Arc<Broadcaster>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
        loop {
            ticker.tick().await;
            sessions.sweep_heartbeats(&broadcaster);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistoryAdapter;
    use crate::model::{Interval, Symbol};

    fn symbol() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    #[tokio::test]
    async fn ping_replies_with_pong() {
        let manager = SessionManager::new();
        let aggregator = Aggregator::new();
        let broadcaster = Broadcaster::new();
        let history: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistoryAdapter::default());

        let (tx, mut rx) = mpsc::channel(16);
        let handle = manager.register(tx);
        manager
            .handle_text(&handle, &aggregator, &broadcaster, &history, r#"{"type":"ping"}"#)
            .await;

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame")
        };
        assert_eq!(text, r#"{"type":"pong"}"#);
    }

    #[tokio::test]
    async fn invalid_interval_reports_exact_error_text() {
        let manager = SessionManager::new();
        let aggregator = Aggregator::new();
        let broadcaster = Broadcaster::new();
        let history: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistoryAdapter::default());

        let (tx, mut rx) = mpsc::channel(16);
        let handle = manager.register(tx);
        manager
            .handle_text(
                &handle,
                &aggregator,
                &broadcaster,
                &history,
                r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"10m"}"#,
            )
            .await;

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame")
        };
        assert_eq!(
            text,
            r#"{"type":"error","message":"Invalid interval: 10m. Valid: 1m, 5m, 15m, 1h, 4h, 1D, 1W"}"#
        );
        assert!(!handle.is_terminated());
    }

    #[tokio::test]
    async fn subscribe_joins_room_before_sending_initial() {
        let manager = SessionManager::new();
        let aggregator = Aggregator::new();
        let broadcaster = Broadcaster::new();
        let history: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistoryAdapter::default());

        let (tx, mut rx) = mpsc::channel(16);
        let handle = manager.register(tx);
        manager
            .handle_text(
                &handle,
                &aggregator,
                &broadcaster,
                &history,
                r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"1m","initialBars":3}"#,
            )
            .await;

        assert!(broadcaster.is_member(
            handle.id,
            &Subscription::new(symbol(), Interval::OneMinute)
        ));
        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame")
        };
        assert!(text.contains(r#""type":"initial""#));
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let manager = SessionManager::new();
        let broadcaster = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(16);
        let handle = manager.register(tx);
        broadcaster.join(
            handle.id,
            handle.sender(),
            Subscription::new(symbol(), Interval::OneMinute),
        );

        manager.handle_disconnect(&handle, &broadcaster);
        assert_eq!(broadcaster.stats().total_rooms, 0);
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn heartbeat_terminates_after_one_missed_cycle() {
        let manager = SessionManager::new();
        let broadcaster = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(16);
        let handle = manager.register(tx);
        broadcaster.join(
            handle.id,
            handle.sender(),
            Subscription::new(symbol(), Interval::OneMinute),
        );

        // First sweep: flag was true, cleared to false, ping sent.
        manager.sweep_heartbeats(&broadcaster);
        assert!(!handle.is_terminated());

        // Second sweep with no intervening mark_alive(): terminated.
        manager.sweep_heartbeats(&broadcaster);
        assert!(handle.is_terminated());
        assert_eq!(broadcaster.stats().total_rooms, 0);
        assert_eq!(manager.count(), 0);
    }
}
