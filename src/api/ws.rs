// =============================================================================
// WebSocket event stream — push-based engine events
// =============================================================================
//
// Clients connect to `/events` and receive:
//   1. An immediate `instanceStates` message with a snapshot of every
//      instance.
//   2. Every subsequent engine event (state changes, signals, logs, data
//      updates, backtest progress) as it is published.
//
// A subscriber that falls behind its queue bound loses the oldest events and
// is told how many were dropped. Ping frames are answered with Pong; the
// connection cleans itself up on any error or Close frame.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::ApiState;

/// Axum handler for the event-stream upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<ApiState>) {
    info!("event-stream client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    // 1. Initial snapshot.
    let snapshot = json!({
        "type": "instanceStates",
        "instances": state.manager.get_all_states(),
    });
    if sender
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        warn!("event-stream client dropped before the initial snapshot");
        return;
    }

    // 2. Push loop + client receive loop.
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            debug!("event-stream send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Slow consumer: report the gap and keep going.
                        let notice = json!({ "type": "eventsDropped", "count": missed });
                        if sender.send(Message::Text(notice.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("event bus closed — ending event stream");
                        break;
                    }
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("event-stream client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/Binary/Pong from clients need no handling.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "event-stream receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }
}
