use std::net::SocketAddr;
use std::sync::Arc;

use peerlink_signaling::state::{spawn_code_reaper, SignalingState};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peerlink_common::init_tracing_with_default("peerlink_signaling=info,peerlink_common=info");

    if let Err(err) = dotenv::dotenv() {
        tracing::warn!("no .env file loaded ({err}); using environment variables or defaults");
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(3004);

    let state = Arc::new(SignalingState::new());
    spawn_code_reaper(state.clone());

    let app = peerlink_signaling::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("signaling server running at ws://localhost:{port}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
