//! End-to-end tests over a real WebSocket transport.
//!
//! The served router is bound to an ephemeral port and driven with
//! tokio-tungstenite clients, real clock included, so the full
//! upgrade → dispatch → writer path is covered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerlink_signaling::state::{spawn_code_reaper, SignalingState};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> SocketAddr {
    let state = Arc::new(SignalingState::new());
    spawn_code_reaper(state.clone());
    let app = peerlink_signaling::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server run");
    });
    addr
}

async fn ws_connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("websocket connect");
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

async fn recv_json(ws: &mut WsClient) -> Value {
    timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await.expect("stream ended").expect("ws error") {
                Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
                Message::Close(_) => panic!("connection closed while awaiting a message"),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

#[tokio::test]
async fn full_rendezvous_and_signal_relay() {
    let addr = spawn_server().await;

    let mut viewer = ws_connect(addr).await;
    send_json(&mut viewer, json!({ "type": "requestCode" })).await;
    let assigned = recv_json(&mut viewer).await;
    assert_eq!(assigned["type"], "codeAssigned");
    let code = assigned["payload"]["code"].as_str().unwrap().to_string();

    let mut client = ws_connect(addr).await;
    send_json(
        &mut client,
        json!({
            "type": "register",
            "role": "client",
            "code": code,
            "payload": { "name": "c1" },
        }),
    )
    .await;
    let established = recv_json(&mut client).await;
    assert_eq!(established["type"], "sessionEstablished");

    // Delayed handshake: viewer learns of the client, client is told to
    // open the peer connection.
    let connected = recv_json(&mut viewer).await;
    assert_eq!(connected["type"], "clientConnected");
    assert_eq!(connected["payload"]["code"], code.as_str());
    assert_eq!(connected["payload"]["clientInfo"]["name"], "c1");

    let connect_msg = recv_json(&mut client).await;
    assert_eq!(connect_msg["type"], "connect");
    assert_eq!(connect_msg["payload"]["message"], "Start WebRTC connection");

    // Opaque relay in both directions.
    let offer = json!({ "type": "offer", "sdp": "v=0\r\ns=-" });
    send_json(
        &mut client,
        json!({ "type": "signal", "code": code, "payload": offer }),
    )
    .await;
    let relayed = recv_json(&mut viewer).await;
    assert_eq!(relayed["type"], "signal");
    assert_eq!(relayed["payload"], offer);
    assert!(relayed["timestamp"].as_i64().unwrap() > 0);

    let candidate = json!({ "candidate": "candidate:0 1 UDP 2122252543 192.0.2.1 54400 typ host" });
    send_json(
        &mut viewer,
        json!({ "type": "signal", "code": code, "payload": candidate }),
    )
    .await;
    let relayed = recv_json(&mut client).await;
    assert_eq!(relayed["payload"], candidate);
}

#[tokio::test]
async fn peer_disconnects_are_announced() {
    let addr = spawn_server().await;

    let mut viewer = ws_connect(addr).await;
    send_json(&mut viewer, json!({ "type": "requestCode" })).await;
    let assigned = recv_json(&mut viewer).await;
    let code = assigned["payload"]["code"].as_str().unwrap().to_string();

    let mut client = ws_connect(addr).await;
    send_json(
        &mut client,
        json!({ "type": "register", "role": "client", "code": code }),
    )
    .await;
    recv_json(&mut client).await; // sessionEstablished

    client.close(None).await.expect("close client");
    drop(client);

    // The viewer may first see the scheduled clientConnected, then the
    // disconnect notice.
    let notice = loop {
        let msg = recv_json(&mut viewer).await;
        if msg["type"] != "clientConnected" {
            break msg;
        }
    };
    assert_eq!(notice["type"], "clientDisconnected");
    assert_eq!(notice["payload"]["code"], code.as_str());
}

#[tokio::test]
async fn unknown_message_type_is_answered_with_an_error() {
    let addr = spawn_server().await;
    let mut ws = ws_connect(addr).await;
    send_json(&mut ws, json!({ "type": "teleport" })).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["message"], "Unknown message type");
}

#[tokio::test]
async fn invalid_code_gets_an_error_then_the_server_hangs_up() {
    let addr = spawn_server().await;
    let mut ws = ws_connect(addr).await;
    send_json(
        &mut ws,
        json!({ "type": "register", "role": "client", "code": "123123" }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(
        reply["payload"]["message"],
        "Invalid code or no viewer waiting for this code"
    );

    // The server closes the transport shortly after flushing the error.
    let closed = timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "expected the server to hang up");
}
