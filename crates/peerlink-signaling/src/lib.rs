//! Peerlink signaling rendezvous server.
//!
//! Pairs a screen-sharing *client* with a controlling *viewer* through a
//! short-lived six-digit code, then relays their opaque WebRTC SDP/ICE
//! envelopes until the peers hold a direct connection. All state is
//! in-memory; a restart drops every session.

#![forbid(unsafe_code)]

pub mod connection;
pub mod dispatch;
pub mod session;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::SignalingState;

/// The signaling app: the WebSocket rendezvous on the root path, no
/// origin check.
pub fn router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
