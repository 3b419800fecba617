//! The message state machine.
//!
//! Every inbound envelope lands here, mutates the registry or a session,
//! and emits zero or more outbound messages. Delayed emissions (the
//! post-pairing handshake, the signal-relay queue, error-path closes) run
//! in spawned one-shot tasks that re-check liveness at fire time; a closed
//! peer turns them into no-ops.

use std::sync::Arc;
use std::time::Duration;

use peerlink_common::{now_millis, Envelope, MessageType, OutboundMessage, Role};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::state::{ClientRegister, DetachOutcome, SignalingState, ViewerRegister};

/// Relay delay keeping SDP/ICE exchanges clear of the pairing handshake.
const SIGNAL_RELAY_DELAY: Duration = Duration::from_millis(50);
/// Grace period letting an error frame flush before the transport shuts.
const ERROR_CLOSE_DELAY: Duration = Duration::from_millis(500);
/// Pairing handshake: viewer learns of the client at this offset.
const VIEWER_NOTIFY_DELAY: Duration = Duration::from_millis(1500);
/// Pairing handshake: the client is told to start WebRTC this long after
/// the viewer notification. Also the reconnect restart delay.
const CLIENT_CONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Route one envelope to its handler.
pub async fn handle_message(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    match msg.kind {
        MessageType::RequestCode => handle_request_code(state, conn).await,
        MessageType::Register => handle_register(state, conn, msg).await,
        MessageType::Signal => handle_signal(state, conn, msg).await,
        MessageType::Connect => handle_connect(state, conn, msg).await,
        MessageType::DisplayConfigChanged => handle_display_config_changed(state, conn, msg).await,
        MessageType::MonitorInfo => handle_monitor_info(state, conn, msg).await,
        MessageType::ProcessInfo => handle_process_info(state, conn, msg).await,
        MessageType::AdminCommand => handle_admin_command(state, conn, msg).await,
        _ => {
            warn!(conn = conn.id(), kind = ?msg.kind, "unknown message type");
            let _ = conn.send(&OutboundMessage::error("Unknown message type"));
        }
    }
}

async fn handle_request_code(state: &Arc<SignalingState>, conn: &Arc<Connection>) {
    let code = state.generate_code().await;
    state.reserve(&code, conn).await;

    let reply = OutboundMessage::new(MessageType::CodeAssigned, json!({ "code": code }));
    if let Err(err) = conn.send(&reply) {
        warn!(conn = conn.id(), "error sending code assignment: {err}");
        return;
    }
    info!(%code, conn = conn.id(), "generated new code for viewer");
}

async fn handle_register(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    match msg.role {
        Some(Role::Client) => handle_client_register(state, conn, msg).await,
        Some(Role::Viewer) => handle_viewer_register(state, conn, msg).await,
        _ => debug!(conn = conn.id(), "register without a usable role, ignoring"),
    }
}

async fn handle_client_register(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    let code = msg.code.unwrap_or_default();
    info!(%code, conn = conn.id(), "client attempting to register");

    match state.register_client(&code, conn, msg.payload.clone()).await {
        ClientRegister::Paired { viewer } => {
            info!(%code, "client registered, session established");
            let reply = OutboundMessage::new(
                MessageType::SessionEstablished,
                json!({ "timestamp": now_millis() }),
            );
            if let Err(err) = conn.send(&reply) {
                warn!(%code, "error sending session establishment: {err}");
            }
            schedule_pairing_handshake(code, conn.clone(), viewer, msg.payload);
        }
        ClientRegister::Reconnected { viewer } => {
            info!(%code, "client reconnected");
            let reply = OutboundMessage::new(
                MessageType::SessionEstablished,
                json!({ "timestamp": now_millis(), "reconnect": true }),
            );
            let _ = conn.send(&reply);

            if let Some(viewer) = viewer {
                if viewer.is_open() {
                    let _ = viewer.send(&OutboundMessage::new(
                        MessageType::ClientReconnected,
                        json!({ "timestamp": now_millis() }),
                    ));
                }
            }

            let client = conn.clone();
            tokio::spawn(async move {
                sleep(CLIENT_CONNECT_DELAY).await;
                if client.is_open() {
                    let _ = client.send(&OutboundMessage::new(
                        MessageType::Connect,
                        json!({
                            "message": "Restart WebRTC connection",
                            "timestamp": now_millis(),
                        }),
                    ));
                }
            });
        }
        ClientRegister::Refreshed => {
            info!(%code, "client session refreshed");
            let _ = conn.send(&OutboundMessage::new(
                MessageType::SessionEstablished,
                json!({ "timestamp": now_millis(), "refresh": true }),
            ));
        }
        ClientRegister::Conflict => {
            let _ = conn.send(&OutboundMessage::error("Session already has an active client"));
            schedule_close(conn.clone());
        }
        ClientRegister::InvalidCode => {
            let _ = conn.send(&OutboundMessage::error(
                "Invalid code or no viewer waiting for this code",
            ));
            schedule_close(conn.clone());
        }
    }
}

/// The two delayed emissions that pace WebRTC negotiation after pairing:
/// the viewer hears about the client, then the client is told to open the
/// peer connection. Liveness is re-checked at each fire time.
fn schedule_pairing_handshake(
    code: String,
    client: Arc<Connection>,
    viewer: Arc<Connection>,
    client_info: Option<Value>,
) {
    tokio::spawn(async move {
        sleep(VIEWER_NOTIFY_DELAY).await;
        if viewer.is_open() {
            info!(%code, "notifying viewer that client connected");
            let notice = OutboundMessage::new(
                MessageType::ClientConnected,
                json!({
                    "timestamp": now_millis(),
                    "code": code,
                    "clientInfo": client_info,
                }),
            );
            if let Err(err) = viewer.send(&notice) {
                warn!(%code, "delayed clientConnected send failed: {err}");
            }
        }

        sleep(CLIENT_CONNECT_DELAY).await;
        if client.is_open() {
            info!(%code, "sending connect signal to client");
            let connect = OutboundMessage::new(
                MessageType::Connect,
                json!({
                    "timestamp": now_millis(),
                    "message": "Start WebRTC connection",
                }),
            );
            if let Err(err) = client.send(&connect) {
                warn!(%code, "delayed connect send failed: {err}");
            }
        }
    });
}

/// Close an offending connection after the error frame has had time to
/// flush.
fn schedule_close(conn: Arc<Connection>) {
    tokio::spawn(async move {
        sleep(ERROR_CLOSE_DELAY).await;
        conn.close();
    });
}

async fn handle_viewer_register(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    let code = msg.code.unwrap_or_default();

    match state.register_viewer(&code, conn).await {
        ViewerRegister::Reserved => {
            info!(%code, conn = conn.id(), "viewer reserved code");
        }
        ViewerRegister::PendingUpdated => {
            info!(%code, conn = conn.id(), "pending code viewer replaced");
        }
        ViewerRegister::Attached {
            rejoined,
            monitor_info,
            client,
        } => {
            info!(%code, conn = conn.id(), rejoined, "viewer attached to session");
            if let Some(cached) = monitor_info {
                let _ = conn.send(&OutboundMessage::new(MessageType::MonitorInfo, cached));
            }
            if !rejoined {
                if let Some(client) = client {
                    if client.is_open() {
                        info!(%code, "notifying client that viewer connected");
                        let _ = client.send(&OutboundMessage::new(
                            MessageType::ViewerConnected,
                            json!({ "timestamp": now_millis() }),
                        ));
                    }
                }
            }
        }
        ViewerRegister::Refused => {
            let _ = conn.send(&OutboundMessage::error(
                "Session already has a viewer connected",
            ));
        }
    }
}

async fn handle_signal(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    let code = msg.code.unwrap_or_default();
    let role = conn.role();
    debug!(%code, %role, "received signal message");

    let Some(session) = state.session(&code).await else {
        warn!(%code, "cannot relay signal: no session found");
        return;
    };

    let peer = match role {
        Role::Client => session.viewer(),
        Role::Viewer => session.client(),
        Role::Unassigned => None,
    };

    match peer {
        Some(peer) if peer.is_open() => {
            debug!(
                %code,
                from = %role,
                kind = signal_kind(msg.payload.as_ref()),
                "forwarding signal"
            );
            let payload = msg.payload;
            tokio::spawn(async move {
                sleep(SIGNAL_RELAY_DELAY).await;
                if peer.is_open() {
                    if let Err(err) = peer.send(&OutboundMessage::stamped(MessageType::Signal, payload)) {
                        debug!("signal relay dropped: {err}");
                    }
                }
            });
        }
        _ => {
            warn!(%code, %role, "cannot relay signal: peer not connected");
        }
    }
}

/// Best-effort label for relay logging; the payload itself stays opaque.
fn signal_kind(payload: Option<&Value>) -> &str {
    match payload {
        Some(value) => {
            if let Some(kind) = value.get("type").and_then(Value::as_str) {
                kind
            } else if value.get("candidate").is_some() {
                "ICE candidate"
            } else {
                "unknown"
            }
        }
        None => "unknown",
    }
}

async fn handle_connect(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    let code = msg.code.unwrap_or_default();
    if conn.role() != Role::Viewer {
        return;
    }
    let Some(session) = state.session(&code).await else {
        return;
    };
    if let Some(client) = session.client() {
        if client.is_open() {
            info!(%code, "forwarding connect request to client");
            let _ = client.send(&OutboundMessage::new(MessageType::Connect, None));
        } else {
            warn!(%code, "client not connected or ready");
        }
    }
}

async fn handle_display_config_changed(
    state: &Arc<SignalingState>,
    conn: &Arc<Connection>,
    msg: Envelope,
) {
    let code = msg.code.unwrap_or_default();
    if conn.role() != Role::Client {
        return;
    }
    let Some(session) = state.session(&code).await else {
        return;
    };
    if let Some(viewer) = session.viewer() {
        if viewer.is_open() {
            let _ = viewer.send(&OutboundMessage::new(
                MessageType::DisplayConfigChanged,
                msg.payload,
            ));
        }
    }
}

async fn handle_monitor_info(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    let code = msg.code.unwrap_or_default();
    if conn.role() != Role::Client {
        return;
    }
    let Some(session) = state.session(&code).await else {
        return;
    };
    info!(%code, "received monitor info from client");
    let viewer = session.cache_monitor_info(msg.payload.clone());
    if let Some(viewer) = viewer {
        if viewer.is_open() {
            let _ = viewer.send(&OutboundMessage::new(MessageType::MonitorInfo, msg.payload));
        }
    }
}

async fn handle_process_info(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    let code = msg.code.unwrap_or_default();
    if conn.role() != Role::Client {
        return;
    }
    let Some(session) = state.session(&code).await else {
        return;
    };
    let viewer = session.cache_process_info(msg.payload.clone());
    if let Some(viewer) = viewer {
        if viewer.is_open() {
            let _ = viewer.send(&OutboundMessage::new(MessageType::ProcessInfo, msg.payload));
        }
    }
}

async fn handle_admin_command(state: &Arc<SignalingState>, conn: &Arc<Connection>, msg: Envelope) {
    if conn.role() != Role::Viewer {
        return;
    }
    let code = msg.code.unwrap_or_default();
    let Some(payload) = msg.payload else {
        return;
    };
    let Some(command) = payload.get("command").cloned() else {
        return;
    };
    info!(%code, command = %command, "received admin command");

    let session = state.session(&code).await;

    if command.as_str() == Some("disconnect") {
        if let Some(session) = &session {
            if let Some(client) = session.client() {
                if client.is_open() {
                    info!(%code, "sending disconnect command to client");
                    let _ = client.send(&OutboundMessage::new(
                        MessageType::AdminCommand,
                        payload.clone(),
                    ));
                }
            }
        }
        let _ = conn.send(&OutboundMessage::new(
            MessageType::AdminCommandResponse,
            json!({
                "command": "disconnect",
                "success": true,
                "message": "Disconnect request sent to client",
            }),
        ));
    } else if let Some(session) = &session {
        match session.client() {
            Some(client) if client.is_open() => {
                let _ = client.send(&OutboundMessage::new(MessageType::AdminCommand, payload));
            }
            _ => {
                let _ = conn.send(&OutboundMessage::error("Client not connected"));
            }
        }
    }
}

/// The close hook, invoked exactly once when a connection's transport
/// terminates.
pub async fn handle_close(state: &Arc<SignalingState>, conn: &Arc<Connection>) {
    info!(conn = conn.id(), "websocket closed");

    let Some(code) = conn.session_code() else {
        return;
    };

    if let Some(DetachOutcome {
        cleared,
        peer,
        evicted,
    }) = state.detach(&code, conn).await
    {
        match cleared {
            Some(Role::Client) => {
                info!(%code, "client disconnected from session");
                if let Some(viewer) = peer {
                    if viewer.is_open() {
                        let _ = viewer.send(&OutboundMessage::new(
                            MessageType::ClientDisconnected,
                            json!({ "timestamp": now_millis(), "code": code }),
                        ));
                    }
                }
            }
            Some(Role::Viewer) => {
                info!(%code, "viewer disconnected from session");
                if let Some(client) = peer {
                    if client.is_open() {
                        let _ = client.send(&OutboundMessage::new(
                            MessageType::ViewerDisconnected,
                            json!({ "timestamp": now_millis(), "code": code }),
                        ));
                    }
                }
            }
            _ => {}
        }
        if evicted {
            info!(%code, "cleaned up empty session");
        }
    }

    if state.drop_pending_for(&code, conn).await {
        info!(%code, "dropped pending code for disconnected viewer");
    }
}
