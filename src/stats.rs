//! Stats/Health: a pure, side-effect-free read of Aggregator, Broadcaster,
//! and Session Manager state, served at `/health/ws-stats`.

use serde::Serialize;

use crate::aggregator::Aggregator;
use crate::broadcaster::{Broadcaster, BroadcasterStats};
use crate::model::Symbol;
use crate::session::SessionManager;

/// Snapshot returned by `GET /health/ws-stats`.
#[derive(Debug, Clone, Serialize)]
pub struct WsStats {
    pub active_sessions: usize,
    pub broadcaster: BroadcasterStats,
    pub send_failures: u64,
    pub windows: Vec<WindowStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub symbol: String,
    pub one_minute_candles: usize,
}

/// Build a [`WsStats`] snapshot. Read-only: takes no locks beyond what
/// each collaborator's own accessor already takes internally.
#[must_use]
pub fn snapshot(
    sessions: &SessionManager,
    broadcaster: &Broadcaster,
    aggregator: &Aggregator,
    tracked_symbols: &[Symbol],
) -> WsStats {
    WsStats {
        active_sessions: sessions.count(),
        send_failures: broadcaster.send_failures(),
        broadcaster: broadcaster.stats(),
        windows: tracked_symbols
            .iter()
            .map(|symbol| WindowStats {
                symbol: symbol.to_string(),
                one_minute_candles: aggregator.window_len(symbol),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_has_zero_counters() {
        let sessions = SessionManager::new();
        let broadcaster = Broadcaster::new();
        let aggregator = Aggregator::new();
        let symbol = Symbol::parse("BTC/USDT").unwrap();

        let stats = snapshot(&sessions, &broadcaster, &aggregator, &[symbol]);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.broadcaster.total_rooms, 0);
        assert_eq!(stats.windows[0].one_minute_candles, 0);
    }
}
