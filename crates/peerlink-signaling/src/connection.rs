//! A single bidirectional peer link.
//!
//! Every accepted WebSocket gets one [`Connection`]. Outbound frames go
//! through an unbounded queue drained by a single writer task per socket,
//! so no two emitters can interleave a frame regardless of how many tasks
//! hold the connection. Once closed, a connection never reopens under the
//! same id; queued sends after close fail locally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use peerlink_common::{Error, OutboundMessage, Result, Role};
use tokio::sync::mpsc::UnboundedSender;

/// Process-unique connection identifier.
pub type ConnId = u64;

/// What the writer task pulls off the outbound queue.
#[derive(Debug)]
pub enum Frame {
    /// One serialized JSON envelope, sent as a single text frame.
    Text(String),
    /// Close the transport after flushing everything queued before it.
    Close,
}

#[derive(Debug, Default)]
struct Meta {
    role: Role,
    session_code: Option<String>,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    connected_at: DateTime<Utc>,
    open: AtomicBool,
    tx: UnboundedSender<Frame>,
    meta: Mutex<Meta>,
}

impl Connection {
    pub fn new(id: ConnId, tx: UnboundedSender<Frame>) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            open: AtomicBool::new(true),
            tx,
            meta: Mutex::new(Meta::default()),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn role(&self) -> Role {
        self.meta().role
    }

    pub fn session_code(&self) -> Option<String> {
        self.meta().session_code.clone()
    }

    /// Bind this connection to a session code as the given role.
    pub fn assign(&self, role: Role, code: &str) {
        let mut meta = self.meta();
        meta.role = role;
        meta.session_code = Some(code.to_string());
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue one envelope for the writer task.
    ///
    /// Safe to call from any task; fails locally once the connection has
    /// closed instead of touching a dead transport.
    pub fn send(&self, message: &OutboundMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let text = serde_json::to_string(message).map_err(Error::serialization)?;
        self.tx
            .send(Frame::Text(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Close the connection. Idempotent; the first call queues a close
    /// frame so the writer task shuts the transport down cleanly.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Frame::Close);
        }
    }

    fn meta(&self) -> MutexGuard<'_, Meta> {
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_common::MessageType;
    use tokio::sync::mpsc;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(1, tx), rx)
    }

    #[test]
    fn frames_arrive_in_emission_order() {
        let (conn, mut rx) = connection();
        for i in 0..3 {
            conn.send(&OutboundMessage::new(
                MessageType::Signal,
                serde_json::json!({ "seq": i }),
            ))
            .unwrap();
        }
        for i in 0..3 {
            match rx.try_recv().unwrap() {
                Frame::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(value["payload"]["seq"], i);
                }
                Frame::Close => panic!("unexpected close frame"),
            }
        }
    }

    #[test]
    fn send_after_close_fails_locally() {
        let (conn, mut rx) = connection();
        conn.close();
        assert!(!conn.is_open());
        let err = conn
            .send(&OutboundMessage::new(MessageType::Connect, None))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(matches!(rx.try_recv().unwrap(), Frame::Close));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, mut rx) = connection();
        conn.close();
        conn.close();
        assert!(matches!(rx.try_recv().unwrap(), Frame::Close));
        assert!(rx.try_recv().is_err(), "second close must not queue again");
    }

    #[test]
    fn assign_updates_role_and_code() {
        let (conn, _rx) = connection();
        assert_eq!(conn.role(), Role::Unassigned);
        assert!(conn.session_code().is_none());
        conn.assign(Role::Viewer, "485102");
        assert_eq!(conn.role(), Role::Viewer);
        assert_eq!(conn.session_code().as_deref(), Some("485102"));
    }
}
