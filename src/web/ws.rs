//! WebSocket relay of encoder output (MPEG1 mode).
//!
//! Every subscriber receives each MPEG-TS chunk the encoder posts, as one
//! binary message. Subscribers are disconnected if the encoder dies.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::pipeline::BridgeState;

/// Handle a single WebSocket connection.
pub async fn handle_ws(
    socket: WebSocket,
    mut output: broadcast::Receiver<Bytes>,
    mut bridge: watch::Receiver<BridgeState>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The encoder may already be gone when the client connects
    let closing = closing_message(&bridge.borrow_and_update());
    if let Some(close) = closing {
        let _ = ws_tx.send(close).await;
        debug!("WebSocket client turned away, encoder not running");
        return;
    }

    loop {
        tokio::select! {
            result = output.recv() => {
                match result {
                    Ok(chunk) => {
                        if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, missed {} chunks", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            changed = bridge.changed() => {
                if changed.is_err() {
                    break;
                }
                let closing = closing_message(&bridge.borrow_and_update());
                if let Some(close) = closing {
                    let _ = ws_tx.send(close).await;
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}

/// Close message owed to subscribers once the encoder is no longer running.
fn closing_message(state: &BridgeState) -> Option<Message> {
    match state {
        BridgeState::Failed(status) => Some(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: format!("encoder exited: {}", status).into(),
        }))),
        BridgeState::Stopped => Some(Message::Close(None)),
        BridgeState::Idle | BridgeState::Running => None,
    }
}
