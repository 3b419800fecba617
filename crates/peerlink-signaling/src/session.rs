//! Session records: a code bound to at most one client and one viewer,
//! plus cached last-known metadata.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use peerlink_common::Role;
use serde_json::Value;
use tokio::time::Instant;

use crate::connection::Connection;

/// A reserved code whose viewer is still waiting for a client.
#[derive(Debug, Clone)]
pub struct PendingCode {
    pub created_at: Instant,
    pub viewer: Arc<Connection>,
}

/// Last-known session metadata, overwritten on updates.
#[derive(Debug)]
pub struct SessionInfo {
    pub created_at: DateTime<Utc>,
    pub monitor_info: Option<Value>,
    pub process_info: Option<Value>,
    pub client_info: Option<Value>,
}

/// The mutable half of a session. One lock guards both slots and the
/// cached info; holders must not send while the lock is held.
#[derive(Debug)]
pub struct Slots {
    pub client: Option<Arc<Connection>>,
    pub viewer: Option<Arc<Connection>>,
    pub info: SessionInfo,
}

/// A paired (or half-open) client/viewer rendezvous.
#[derive(Debug)]
pub struct Session {
    code: String,
    slots: Mutex<Slots>,
}

/// Outcome of a viewer registration against a live session.
pub enum ViewerAttach {
    Attached {
        /// The slot already held this same viewer.
        rejoined: bool,
        monitor_info: Option<Value>,
        client: Option<Arc<Connection>>,
    },
    /// The session already has a different viewer.
    Refused,
}

/// Outcome of a client registration against a live session.
pub enum SessionClientRegister {
    /// The slot was empty or held a dead connection; this one took it.
    Reconnected { viewer: Option<Arc<Connection>> },
    /// The same client registered again.
    Refreshed,
    /// A different client is still live on this session.
    Conflict,
}

impl Session {
    pub fn new(
        code: &str,
        client: Arc<Connection>,
        viewer: Arc<Connection>,
        client_info: Option<Value>,
    ) -> Self {
        Self {
            code: code.to_string(),
            slots: Mutex::new(Slots {
                client: Some(client),
                viewer: Some(viewer),
                info: SessionInfo {
                    created_at: Utc::now(),
                    monitor_info: None,
                    process_info: None,
                    client_info,
                },
            }),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn client(&self) -> Option<Arc<Connection>> {
        self.slots().client.clone()
    }

    pub fn viewer(&self) -> Option<Arc<Connection>> {
        self.slots().viewer.clone()
    }

    /// Attach a viewer, refusing if a different one is already seated.
    pub fn attach_viewer(&self, conn: &Arc<Connection>) -> ViewerAttach {
        let mut slots = self.slots();
        let rejoined = match slots.viewer.as_ref() {
            Some(current) if current.id() == conn.id() => true,
            Some(_) => return ViewerAttach::Refused,
            None => false,
        };
        slots.viewer = Some(conn.clone());
        conn.assign(Role::Viewer, &self.code);
        ViewerAttach::Attached {
            rejoined,
            monitor_info: slots.info.monitor_info.clone(),
            client: slots.client.clone(),
        }
    }

    /// Seat a client, replacing a missing or dead one, refreshing the
    /// same one, and refusing a second live client.
    pub fn register_client(&self, conn: &Arc<Connection>) -> SessionClientRegister {
        let mut slots = self.slots();
        match slots.client.as_ref() {
            None => {}
            Some(current) if !current.is_open() => {}
            Some(current) if current.id() == conn.id() => {
                return SessionClientRegister::Refreshed;
            }
            Some(_) => return SessionClientRegister::Conflict,
        }
        slots.client = Some(conn.clone());
        conn.assign(Role::Client, &self.code);
        SessionClientRegister::Reconnected {
            viewer: slots.viewer.clone(),
        }
    }

    /// Cache the latest monitor metadata; returns the viewer snapshot so
    /// the caller can forward after releasing the lock.
    pub fn cache_monitor_info(&self, payload: Option<Value>) -> Option<Arc<Connection>> {
        let mut slots = self.slots();
        slots.info.monitor_info = payload;
        slots.viewer.clone()
    }

    /// Cache the latest process metadata; returns the viewer snapshot.
    pub fn cache_process_info(&self, payload: Option<Value>) -> Option<Arc<Connection>> {
        let mut slots = self.slots();
        slots.info.process_info = payload;
        slots.viewer.clone()
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
