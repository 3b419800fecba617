//! WebSocket transport: the upgrade handler on the root path, the reader
//! loop feeding the dispatcher, and the single writer task per socket.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use peerlink_common::{Envelope, OutboundMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Frame};
use crate::dispatch;
use crate::state::SignalingState;

/// Inbound frame ceiling.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalingState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<SignalingState>, addr: SocketAddr) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = state.register_connection(tx).await;
    info!(conn = conn.id(), %addr, "new websocket connection established");

    let writer = tokio::spawn(write_loop(sink, rx));
    read_loop(&state, &conn, stream).await;

    // Wake the writer so it flushes and shuts the transport, then run the
    // close hook exactly once before releasing the id.
    conn.close();
    dispatch::handle_close(&state, &conn).await;
    state.remove_connection(conn.id()).await;
    let _ = writer.await;
    let lifetime = chrono::Utc::now() - conn.connected_at();
    info!(
        conn = conn.id(),
        seconds = lifetime.num_seconds(),
        "connection torn down"
    );
}

/// Sole writer for one socket; emitters queue frames through the
/// connection and never touch the sink directly.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Frame::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn read_loop(state: &Arc<SignalingState>, conn: &Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    while let Some(next) = stream.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn = conn.id(), "websocket error: {err}");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(conn = conn.id(), "non-UTF-8 binary frame");
                    break;
                }
            },
            Message::Close(_) => {
                debug!(conn = conn.id(), "websocket closed by peer");
                break;
            }
            // Ping/pong are answered by the protocol layer.
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(conn = conn.id(), "unparseable frame: {err}");
                break;
            }
        };
        debug!(conn = conn.id(), kind = ?envelope.kind, "received message");

        // A handler panic must not take the peer loop down with it.
        let handled = AssertUnwindSafe(dispatch::handle_message(state, conn, envelope))
            .catch_unwind()
            .await;
        if handled.is_err() {
            error!(conn = conn.id(), "recovered from panic in message handler");
            let _ = conn.send(&OutboundMessage::error("Internal server error"));
        }
    }
}
