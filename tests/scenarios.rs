//! End-to-end scenarios exercising the Aggregator, Broadcaster, and
//! Session Manager together, calling their public APIs directly rather
//! than opening real sockets.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use candle_gateway::aggregator::Aggregator;
use candle_gateway::broadcaster::{Broadcaster, Subscription};
use candle_gateway::history::{HistoryAdapter, InMemoryHistoryAdapter};
use candle_gateway::model::{Candle, Interval, Symbol};
use candle_gateway::session::SessionManager;
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

fn symbol() -> Symbol {
    Symbol::parse("BTC/USDT").unwrap()
}

fn candle_at(minute: i64, close: rust_decimal::Decimal, volume: rust_decimal::Decimal) -> Candle {
    Candle::new(
        Utc.timestamp_millis_opt(minute * 60_000).unwrap(),
        dec!(1),
        dec!(2),
        dec!(1),
        close,
        volume,
        None,
    )
    .unwrap()
}

async fn recv_text(rx: &mut mpsc::Receiver<Message>) -> String {
    match tokio::time::timeout(Duration::from_millis(1_500), rx.recv())
        .await
        .expect("message did not arrive in time")
        .expect("channel closed")
    {
        Message::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribe_then_update_delivers_initial_bars_then_the_live_tick() {
    let aggregator = Aggregator::new();
    let broadcaster = Broadcaster::new();
    let sessions = SessionManager::new();
    let history: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistoryAdapter::default());

    aggregator.ingest(&symbol(), candle_at(10 * 60, dec!(2), dec!(1))).unwrap();
    aggregator.ingest(&symbol(), candle_at(10 * 60 + 1, dec!(3), dec!(1))).unwrap();
    aggregator.ingest(&symbol(), candle_at(10 * 60 + 2, dec!(4), dec!(1))).unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let session = sessions.register(tx);
    sessions
        .handle_text(
            &session,
            &aggregator,
            &broadcaster,
            &history,
            r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"1m","initialBars":3}"#,
        )
        .await;

    let initial = recv_text(&mut rx).await;
    assert!(initial.contains(r#""type":"initial""#));
    assert!(initial.contains(r#""close":4"#));

    aggregator.ingest(&symbol(), candle_at(10 * 60 + 2, dec!(5), dec!(2))).unwrap();
    broadcaster.refresh(&aggregator, &symbol());
    broadcaster.dispatch_tick();

    let update = recv_text(&mut rx).await;
    assert!(update.contains(r#""type":"update""#));
    assert!(update.contains(r#""close":5"#));
    assert!(update.contains(r#""volume":2"#));
}

#[test]
fn higher_timeframe_bar_aggregates_its_contributing_one_minute_candles() {
    let aggregator = Aggregator::new();
    aggregator
        .ingest(&symbol(), Candle::new(
            Utc.timestamp_millis_opt(10 * 60 * 60_000).unwrap(),
            dec!(10), dec!(12), dec!(9), dec!(11), dec!(5), None,
        ).unwrap())
        .unwrap();
    aggregator
        .ingest(&symbol(), Candle::new(
            Utc.timestamp_millis_opt((10 * 60 + 1) * 60_000).unwrap(),
            dec!(11), dec!(15), dec!(10), dec!(14), dec!(3), None,
        ).unwrap())
        .unwrap();

    let at = Utc.with_ymd_and_hms(1970, 1, 1, 10, 2, 0).unwrap();
    let bar = aggregator.at(&symbol(), Interval::FiveMinutes, at).unwrap();
    assert_eq!(bar.open, dec!(10));
    assert_eq!(bar.high, dec!(15));
    assert_eq!(bar.low, dec!(9));
    assert_eq!(bar.close, dec!(14));
    assert_eq!(bar.volume, dec!(8));
}

/// At most ~1 update/sec per room regardless of ingest rate.
#[tokio::test]
async fn rapid_ingests_are_throttled_to_one_update_per_room_per_tick() {
    let aggregator = Aggregator::new();
    let broadcaster = Broadcaster::new();
    let (tx1, mut rx1) = mpsc::channel(64);
    let (tx2, mut rx2) = mpsc::channel(64);
    let sub = Subscription::new(symbol(), Interval::OneMinute);

    broadcaster.join(uuid::Uuid::new_v4(), tx1, sub.clone());
    broadcaster.join(uuid::Uuid::new_v4(), tx2, sub);

    for i in 0..10 {
        aggregator
            .ingest(&symbol(), candle_at(0, dec!(1) + rust_decimal::Decimal::from(i), dec!(1)))
            .unwrap();
        broadcaster.refresh(&aggregator, &symbol());
        broadcaster.dispatch_tick();
    }

    let mut count1 = 0;
    while rx1.try_recv().is_ok() {
        count1 += 1;
    }
    let mut count2 = 0;
    while rx2.try_recv().is_ok() {
        count2 += 1;
    }
    assert!(count1 <= 2, "client 1 received {count1} updates, expected <= 2");
    assert!(count2 <= 2, "client 2 received {count2} updates, expected <= 2");
}

#[test]
fn disconnect_releases_every_room_membership() {
    let broadcaster = Broadcaster::new();
    let sessions = SessionManager::new();
    let (tx, _rx) = mpsc::channel(16);
    let session = sessions.register(tx);

    let mut room_receivers = Vec::new();
    for interval in [Interval::OneMinute, Interval::FiveMinutes, Interval::OneHour] {
        let (room_tx, room_rx) = mpsc::channel(16);
        room_receivers.push(room_rx);
        broadcaster.join(session.id, room_tx, Subscription::new(symbol(), interval));
    }
    assert_eq!(broadcaster.stats().total_rooms, 3);

    sessions.handle_disconnect(&session, &broadcaster);
    assert_eq!(broadcaster.stats().total_rooms, 0);
    for interval in [Interval::OneMinute, Interval::FiveMinutes, Interval::OneHour] {
        assert!(!broadcaster.is_member(session.id, &Subscription::new(symbol(), interval)));
    }
}

/// Two missed heartbeat sweeps terminate the session and release its
/// room memberships.
#[test]
fn heartbeat_timeout_releases_memberships() {
    let broadcaster = Broadcaster::new();
    let sessions = SessionManager::new();
    let (tx, _rx) = mpsc::channel(16);
    let session = sessions.register(tx);
    let (room_tx, _room_rx) = mpsc::channel(16);
    broadcaster.join(session.id, room_tx, Subscription::new(symbol(), Interval::OneMinute));

    sessions.sweep_heartbeats(&broadcaster);
    assert!(!session.is_terminated());
    sessions.sweep_heartbeats(&broadcaster);
    assert!(session.is_terminated());
    assert_eq!(broadcaster.stats().total_rooms, 0);
}

#[tokio::test]
async fn protocol_error_leaves_connection_open_for_a_later_valid_subscribe() {
    let aggregator = Aggregator::new();
    let broadcaster = Broadcaster::new();
    let sessions = SessionManager::new();
    let history: Arc<dyn HistoryAdapter> = Arc::new(InMemoryHistoryAdapter::default());
    aggregator.ingest(&symbol(), candle_at(0, dec!(1), dec!(1))).unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let session = sessions.register(tx);

    sessions
        .handle_text(
            &session,
            &aggregator,
            &broadcaster,
            &history,
            r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"10m"}"#,
        )
        .await;
    let error = recv_text(&mut rx).await;
    assert_eq!(
        error,
        r#"{"type":"error","message":"Invalid interval: 10m. Valid: 1m, 5m, 15m, 1h, 4h, 1D, 1W"}"#
    );

    sessions
        .handle_text(
            &session,
            &aggregator,
            &broadcaster,
            &history,
            r#"{"type":"subscribe","symbol":"BTC/USDT","interval":"1m"}"#,
        )
        .await;
    let initial = recv_text(&mut rx).await;
    assert!(initial.contains(r#""type":"initial""#));
}
