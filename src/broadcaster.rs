//! Room Broadcaster: groups sessions by `(symbol, interval)`, runs the
//! 1-second throttled dispatch loop, and caches each room's current candle.
//! The registry shape here — a set of subscribers to a channel, fanned out
//! on a timer — uses an `FxHashMap` for the room table, matching the
//! general-purpose hashing convention used elsewhere in this crate.

use std::time::Duration;

use axum::extract::ws::Message;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::aggregator::{now_millis, Aggregator};
use crate::metrics::get_metrics;
use crate::model::{Interval, Symbol};
use crate::protocol::ServerMessage;

/// One second floor between emissions to the same room.
pub const BROADCAST_PERIOD_MS: i64 = 1_000;
/// Outbound queue capacity per session; a full queue counts as a send
/// failure for that dispatch pass rather than blocking.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Opaque per-connection identifier, shared between the Broadcaster's room
/// membership and the Session Manager's session table.
pub type SessionId = Uuid;

/// `(symbol, interval)` pair identifying a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub symbol: Symbol,
    pub interval: Interval,
}

impl Subscription {
    #[must_use]
    pub fn new(symbol: Symbol, interval: Interval) -> Self {
        Self { symbol, interval }
    }
}

struct Room {
    clients: FxHashMap<SessionId, mpsc::Sender<Message>>,
    current_candle: Option<crate::model::Candle>,
    last_broadcast_at: i64,
}

impl Room {
    fn new() -> Self {
        Self {
            clients: FxHashMap::default(),
            current_candle: None,
            last_broadcast_at: 0,
        }
    }
}

/// Snapshot of one room's state, for `/health/ws-stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoomStats {
    pub key: String,
    pub client_count: usize,
    pub has_candle: bool,
    pub last_broadcast_at: i64,
}

/// Snapshot of the whole registry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BroadcasterStats {
    pub total_rooms: usize,
    pub total_clients: usize,
    pub rooms: Vec<RoomStats>,
}

/// Room registry and dispatch driver.
pub struct Broadcaster {
    rooms: parking_lot::Mutex<FxHashMap<Subscription, Room>>,
    send_failures: std::sync::atomic::AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: parking_lot::Mutex::new(FxHashMap::default()),
            send_failures: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Create the room if absent and add `session`. Idempotent.
    pub fn join(&self, session: SessionId, sender: mpsc::Sender<Message>, sub: Subscription) {
        let mut rooms = self.rooms.lock();
        rooms.entry(sub).or_insert_with(Room::new).clients.insert(session, sender);
    }

    /// Remove `session` from `sub`'s room; delete the room if it becomes
    /// empty. No-op if the session was not a member.
    pub fn leave(&self, session: SessionId, sub: &Subscription) {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get_mut(sub) {
            room.clients.remove(&session);
            if room.clients.is_empty() {
                rooms.remove(sub);
            }
        }
    }

    /// Remove `session` from every room it belongs to.
    pub fn leave_all(&self, session: SessionId) {
        let mut rooms = self.rooms.lock();
        rooms.retain(|_, room| {
            room.clients.remove(&session);
            !room.clients.is_empty()
        });
    }

    /// For every room on `symbol`, re-derive its current candle from the
    /// Aggregator and cache it. Always called immediately after the
    /// matching `Aggregator::ingest` so it observes that ingest's effects.
    pub fn refresh(&self, aggregator: &Aggregator, symbol: &Symbol) {
        let mut rooms = self.rooms.lock();
        for (sub, room) in rooms.iter_mut() {
            if &sub.symbol != symbol {
                continue;
            }
            if let Some(candle) = aggregator.current(symbol, sub.interval) {
                room.current_candle = Some(candle);
            }
        }
    }

    /// Whether `session` is currently a member of `sub`'s room.
    #[must_use]
    pub fn is_member(&self, session: SessionId, sub: &Subscription) -> bool {
        self.rooms
            .lock()
            .get(sub)
            .is_some_and(|room| room.clients.contains_key(&session))
    }

    /// Run one dispatch pass: for every non-empty room whose cached candle
    /// is present and whose throttle window has elapsed, emit an `update`
    /// to every client. Failed sends are counted, never removed here —
    /// disconnection is the Session Manager's job.
    pub fn dispatch_tick(&self) {
        get_metrics().record_broadcast_tick();
        let now = now_millis();
        let mut rooms = self.rooms.lock();
        get_metrics().record_rooms_active(rooms.len());
        for (sub, room) in rooms.iter_mut() {
            if room.clients.is_empty() {
                continue;
            }
            let Some(candle) = room.current_candle.clone() else {
                continue;
            };
            if now - room.last_broadcast_at < BROADCAST_PERIOD_MS {
                continue;
            }

            let message = ServerMessage::Update {
                symbol: sub.symbol.clone(),
                interval: sub.interval,
                bar: candle,
            };
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };

            for sender in room.clients.values() {
                if sender.try_send(Message::Text(text.clone())).is_err() {
                    self.send_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    get_metrics().record_broadcast_send_failure();
                    warn!(room = %sub.symbol, "dropped update: outbound queue full or closed");
                }
            }
            room.last_broadcast_at = now;
        }
    }

    /// Total send failures observed across all dispatch passes so far.
    #[must_use]
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Read-only registry snapshot. May tolerate eventual consistency
    /// relative to concurrent mutations.
    #[must_use]
    pub fn stats(&self) -> BroadcasterStats {
        let rooms = self.rooms.lock();
        let mut total_clients = 0;
        let room_stats = rooms
            .iter()
            .map(|(sub, room)| {
                total_clients += room.clients.len();
                RoomStats {
                    key: format!("{}:{}", sub.symbol, sub.interval),
                    client_count: room.clients.len(),
                    has_candle: room.current_candle.is_some(),
                    last_broadcast_at: room.last_broadcast_at,
                }
            })
            .collect();

        BroadcasterStats {
            total_rooms: rooms.len(),
            total_clients,
            rooms: room_stats,
        }
    }
}

/// Spawn the recurring 1-second dispatch loop — a single recurring task,
/// not one per room. Returns a handle the caller can abort on shutdown.
pub fn spawn_dispatch_loop(
    broadcaster: std::sync::Arc<Broadcaster>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(BROADCAST_PERIOD_MS as u64));
        loop {
            ticker.tick().await;
            broadcaster.dispatch_tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn symbol() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    fn sub(interval: Interval) -> Subscription {
        Subscription::new(symbol(), interval)
    }

    fn candle() -> crate::model::Candle {
        crate::model::Candle::new(
            Utc.timestamp_millis_opt(0).unwrap(),
            dec!(1),
            dec!(1),
            dec!(1),
            dec!(1),
            dec!(1),
            None,
        )
        .unwrap()
    }

    #[test]
    fn join_creates_room_and_is_idempotent() {
        let b = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        b.join(session, tx.clone(), sub(Interval::OneMinute));
        b.join(session, tx, sub(Interval::OneMinute));
        assert_eq!(b.stats().total_rooms, 1);
        assert_eq!(b.stats().total_clients, 1);
    }

    #[test]
    fn leave_empties_and_removes_room() {
        let b = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        let s = sub(Interval::OneMinute);
        b.join(session, tx, s.clone());
        b.leave(session, &s);
        assert_eq!(b.stats().total_rooms, 0);
    }

    #[test]
    fn leave_all_clears_every_membership() {
        let b = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        b.join(session, tx.clone(), sub(Interval::OneMinute));
        b.join(session, tx, sub(Interval::OneHour));
        b.leave_all(session);
        assert_eq!(b.stats().total_rooms, 0);
    }

    #[test]
    fn join_then_leave_restores_prior_state() {
        let b = Broadcaster::new();
        let before = b.stats().total_rooms;
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        let s = sub(Interval::FifteenMinutes);
        b.join(session, tx, s.clone());
        b.leave(session, &s);
        assert_eq!(b.stats().total_rooms, before);
    }

    #[test]
    fn refresh_caches_current_candle_for_matching_symbol() {
        let aggregator = Aggregator::new();
        aggregator.ingest(&symbol(), candle()).unwrap();
        let b = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        b.join(session, tx, sub(Interval::OneMinute));
        b.refresh(&aggregator, &symbol());
        assert!(b.stats().rooms[0].has_candle);
    }

    #[tokio::test]
    async fn dispatch_emits_update_to_room_members() {
        let aggregator = Aggregator::new();
        aggregator.ingest(&symbol(), candle()).unwrap();
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        b.join(session, tx, sub(Interval::OneMinute));
        b.refresh(&aggregator, &symbol());
        b.dispatch_tick();

        let message = rx.recv().await.unwrap();
        let Message::Text(text) = message else {
            panic!("expected text frame")
        };
        assert!(text.contains(r#""type":"update""#));
    }

    #[test]
    fn dispatch_respects_per_room_throttle() {
        let aggregator = Aggregator::new();
        aggregator.ingest(&symbol(), candle()).unwrap();
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let session = Uuid::new_v4();
        b.join(session, tx, sub(Interval::OneMinute));
        b.refresh(&aggregator, &symbol());

        b.dispatch_tick();
        b.dispatch_tick();
        b.dispatch_tick();

        assert_eq!(rx.try_recv().is_ok(), true);
        assert!(rx.try_recv().is_err(), "second tick should have been throttled");
    }
}
