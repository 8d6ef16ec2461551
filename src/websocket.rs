//! WebSocket upgrade and per-connection task wiring: split sender/
//! receiver, a writer task draining an mpsc channel, and a reader loop
//! dispatching inbound frames against the Session Manager's per-session
//! outbound queue, plus a forced-termination signal for heartbeat
//! timeouts.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::metrics::get_metrics;
use crate::server::AppState;

/// Handle a WebSocket upgrade request on the root path.
pub async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel(crate::broadcaster::OUTBOUND_QUEUE_CAPACITY);

    let session = state.sessions.register(tx);
    get_metrics().record_session_opened();
    info!(session = %session.id, "session opened");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            () = session.terminate_signal.notified() => {
                debug!(session = %session.id, "session force-terminated by heartbeat sweep");
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        state
                            .sessions
                            .handle_text(
                                &session,
                                &state.aggregator,
                                &state.broadcaster,
                                &state.history,
                                &text,
                            )
                            .await;
                    }
                    Some(Ok(Message::Pong(_))) => session.mark_alive(),
                    Some(Ok(Message::Ping(_))) => session.mark_alive(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        warn!(session = %session.id, "binary frames are not supported, ignoring");
                    }
                    Some(Err(err)) => {
                        warn!(session = %session.id, %err, "websocket transport error");
                        break;
                    }
                }
            }
        }
    }

    writer.abort();
    if !session.is_terminated() {
        state.sessions.handle_disconnect(&session, &state.broadcaster);
    }
    get_metrics().record_session_closed();
    info!(session = %session.id, "session closed");
}
