//! Global rendezvous state: the code registry, the session table, and the
//! live-connection index.
//!
//! One reader/writer lock guards the four indexes; each session carries its
//! own slot lock. Lock order is always tables, then session, then
//! connection internals. Handlers snapshot the `Arc<Connection>` references
//! they need and send only after every lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use peerlink_common::Role;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Connection, Frame};
use crate::session::{PendingCode, Session, SessionClientRegister, ViewerAttach};

/// Unclaimed codes are reaped after this long.
pub const PENDING_CODE_TTL: Duration = Duration::from_secs(30 * 60);
/// How often the reaper sweeps.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

const GENERATE_FAST_ATTEMPTS: usize = 10;
const GENERATE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Arc<Session>>,
    pending_codes: HashMap<String, PendingCode>,
    active_codes: HashSet<String>,
    connections: HashMap<ConnId, Arc<Connection>>,
    next_conn_id: ConnId,
}

/// Outcome of `register role=viewer`.
pub enum ViewerRegister {
    /// No pending entry and no session existed; the code is now pending
    /// with this viewer.
    Reserved,
    /// A pending entry existed; its viewer pointer now points here.
    PendingUpdated,
    /// A session existed and the viewer slot was free or already ours.
    Attached {
        rejoined: bool,
        monitor_info: Option<Value>,
        client: Option<Arc<Connection>>,
    },
    /// A session existed with a different viewer seated.
    Refused,
}

/// Outcome of `register role=client`.
pub enum ClientRegister {
    /// A pending entry was claimed; the session now exists.
    Paired { viewer: Arc<Connection> },
    /// An existing session had a free or dead client slot.
    Reconnected { viewer: Option<Arc<Connection>> },
    /// The same client registered again on its own session.
    Refreshed,
    /// A different live client already owns the session.
    Conflict,
    /// Neither a pending entry nor a session exists for the code.
    InvalidCode,
}

/// What a connection close changed about its session.
pub struct DetachOutcome {
    /// Which slot this connection vacated, if any.
    pub cleared: Option<Role>,
    /// The remaining peer at the moment the slot was cleared.
    pub peer: Option<Arc<Connection>>,
    /// Both slots drained; the session was evicted and its code released.
    pub evicted: bool,
}

pub struct SignalingState {
    tables: RwLock<Tables>,
}

impl Default for SignalingState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingState {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_conn_id: 1,
                ..Tables::default()
            }),
        }
    }

    /// Admit a new connection and hand out its process-unique id.
    pub async fn register_connection(&self, tx: UnboundedSender<Frame>) -> Arc<Connection> {
        let mut tables = self.tables.write().await;
        let id = tables.next_conn_id;
        tables.next_conn_id += 1;
        let conn = Arc::new(Connection::new(id, tx));
        tables.connections.insert(id, conn.clone());
        conn
    }

    /// Release a connection id once its socket is fully torn down.
    pub async fn remove_connection(&self, id: ConnId) {
        self.tables.write().await.connections.remove(&id);
    }

    /// Produce a fresh six-digit code and mark it active.
    ///
    /// Ten random attempts over the full range; when the table is dense
    /// enough to exhaust them, later rounds log the degradation, narrow
    /// the range, and back off briefly between rounds. A colliding code
    /// is never handed out.
    pub async fn generate_code(&self) -> String {
        let mut rounds = 0usize;
        loop {
            {
                let mut tables = self.tables.write().await;
                for _ in 0..GENERATE_FAST_ATTEMPTS {
                    let code = if rounds == 0 {
                        format!("{:06}", rand::thread_rng().gen_range(100_000..=999_999))
                    } else {
                        format!("{:06}", rand::thread_rng().gen_range(200_000..=899_999))
                    };
                    if !tables.active_codes.contains(&code) {
                        tables.active_codes.insert(code.clone());
                        return code;
                    }
                }
                warn!(
                    active_codes = tables.active_codes.len(),
                    "many code generation attempts, retrying"
                );
            }
            rounds += 1;
            tokio::time::sleep(GENERATE_BACKOFF).await;
        }
    }

    /// Insert a pending entry for a code the caller already holds.
    pub async fn reserve(&self, code: &str, viewer: &Arc<Connection>) {
        let mut tables = self.tables.write().await;
        tables.active_codes.insert(code.to_string());
        tables.pending_codes.insert(
            code.to_string(),
            PendingCode {
                created_at: Instant::now(),
                viewer: viewer.clone(),
            },
        );
        viewer.assign(Role::Viewer, code);
    }

    /// Remove and return a pending entry. The code stays active.
    pub async fn claim(&self, code: &str) -> Option<PendingCode> {
        self.tables.write().await.pending_codes.remove(code)
    }

    /// Drop a code from the active set and the pending index.
    pub async fn release(&self, code: &str) {
        let mut tables = self.tables.write().await;
        tables.active_codes.remove(code);
        tables.pending_codes.remove(code);
    }

    /// Delete every pending entry older than [`PENDING_CODE_TTL`],
    /// releasing the codes with them.
    pub async fn reap_expired(&self, now: Instant) {
        let mut tables = self.tables.write().await;
        let expired: Vec<String> = tables
            .pending_codes
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.created_at) > PENDING_CODE_TTL)
            .map(|(code, _)| code.clone())
            .collect();
        for code in expired {
            info!(%code, "removing expired pending code");
            tables.pending_codes.remove(&code);
            tables.active_codes.remove(&code);
        }
    }

    pub async fn session(&self, code: &str) -> Option<Arc<Session>> {
        self.tables.read().await.sessions.get(code).cloned()
    }

    /// Route `register role=viewer` to reserve, attach, overwrite, or
    /// refuse, atomically against the tables.
    pub async fn register_viewer(&self, code: &str, conn: &Arc<Connection>) -> ViewerRegister {
        let mut tables = self.tables.write().await;
        if let Some(session) = tables.sessions.get(code).cloned() {
            return match session.attach_viewer(conn) {
                ViewerAttach::Attached {
                    rejoined,
                    monitor_info,
                    client,
                } => ViewerRegister::Attached {
                    rejoined,
                    monitor_info,
                    client,
                },
                ViewerAttach::Refused => ViewerRegister::Refused,
            };
        }
        if let Some(pending) = tables.pending_codes.get_mut(code) {
            pending.viewer = conn.clone();
            conn.assign(Role::Viewer, code);
            return ViewerRegister::PendingUpdated;
        }
        tables.active_codes.insert(code.to_string());
        tables.pending_codes.insert(
            code.to_string(),
            PendingCode {
                created_at: Instant::now(),
                viewer: conn.clone(),
            },
        );
        conn.assign(Role::Viewer, code);
        ViewerRegister::Reserved
    }

    /// Route `register role=client` to pair, reconnect, refresh, or
    /// refuse, atomically against the tables.
    pub async fn register_client(
        &self,
        code: &str,
        conn: &Arc<Connection>,
        client_info: Option<Value>,
    ) -> ClientRegister {
        let mut tables = self.tables.write().await;
        if let Some(pending) = tables.pending_codes.remove(code) {
            let viewer = pending.viewer;
            let session = Arc::new(Session::new(code, conn.clone(), viewer.clone(), client_info));
            tables.sessions.insert(code.to_string(), session);
            tables.active_codes.insert(code.to_string());
            conn.assign(Role::Client, code);
            viewer.assign(Role::Viewer, code);
            return ClientRegister::Paired { viewer };
        }
        if let Some(session) = tables.sessions.get(code).cloned() {
            return match session.register_client(conn) {
                SessionClientRegister::Reconnected { viewer } => {
                    ClientRegister::Reconnected { viewer }
                }
                SessionClientRegister::Refreshed => ClientRegister::Refreshed,
                SessionClientRegister::Conflict => ClientRegister::Conflict,
            };
        }
        ClientRegister::InvalidCode
    }

    /// Clear whichever session slot this connection occupied; evict the
    /// session and release the code when both slots drain.
    pub async fn detach(&self, code: &str, conn: &Connection) -> Option<DetachOutcome> {
        let mut tables = self.tables.write().await;
        let session = tables.sessions.get(code).cloned()?;

        let mut cleared = None;
        let mut peer = None;
        let empty = {
            let mut slots = session.slots();
            match conn.role() {
                Role::Client
                    if slots.client.as_ref().is_some_and(|c| c.id() == conn.id()) =>
                {
                    slots.client = None;
                    cleared = Some(Role::Client);
                    peer = slots.viewer.clone();
                }
                Role::Viewer
                    if slots.viewer.as_ref().is_some_and(|v| v.id() == conn.id()) =>
                {
                    slots.viewer = None;
                    cleared = Some(Role::Viewer);
                    peer = slots.client.clone();
                }
                _ => {}
            }
            slots.client.is_none() && slots.viewer.is_none()
        };

        let evicted = if empty {
            tables.sessions.remove(code);
            tables.active_codes.remove(code);
            true
        } else {
            false
        };

        Some(DetachOutcome {
            cleared,
            peer,
            evicted,
        })
    }

    /// Drop the pending entry for `code` if this connection is its
    /// viewer. The code deliberately stays in the active set; only an
    /// emptied session or the TTL reaper releases it.
    pub async fn drop_pending_for(&self, code: &str, conn: &Connection) -> bool {
        let mut tables = self.tables.write().await;
        if tables
            .pending_codes
            .get(code)
            .is_some_and(|pending| pending.viewer.id() == conn.id())
        {
            tables.pending_codes.remove(code);
            return true;
        }
        false
    }

    pub async fn is_code_active(&self, code: &str) -> bool {
        self.tables.read().await.active_codes.contains(code)
    }

    pub async fn has_pending(&self, code: &str) -> bool {
        self.tables.read().await.pending_codes.contains_key(code)
    }
}

/// Sweep expired pending codes every [`REAP_INTERVAL`].
pub fn spawn_code_reaper(state: Arc<SignalingState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            debug!("sweeping expired pending codes");
            state.reap_expired(Instant::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn connect(state: &SignalingState) -> (Arc<Connection>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.register_connection(tx).await, rx)
    }

    #[tokio::test]
    async fn generated_codes_are_six_digits_and_stay_active() {
        let state = SignalingState::new();
        for _ in 0..32 {
            let code = state.generate_code().await;
            assert_eq!(code.len(), 6);
            let n: u32 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&n));
            assert!(state.is_code_active(&code).await);
        }
    }

    #[tokio::test]
    async fn generated_codes_never_collide() {
        let state = SignalingState::new();
        let mut seen = HashSet::new();
        for _ in 0..256 {
            assert!(seen.insert(state.generate_code().await));
        }
    }

    #[tokio::test]
    async fn pairing_keeps_pending_and_sessions_disjoint() {
        let state = SignalingState::new();
        let (viewer, _viewer_rx) = connect(&state).await;
        let (client, _client_rx) = connect(&state).await;

        state.reserve("485102", &viewer).await;
        assert!(state.has_pending("485102").await);
        assert!(state.is_code_active("485102").await);

        match state.register_client("485102", &client, None).await {
            ClientRegister::Paired { viewer: paired } => assert_eq!(paired.id(), viewer.id()),
            _ => panic!("expected pairing"),
        }
        assert!(!state.has_pending("485102").await);
        assert!(state.session("485102").await.is_some());
        assert!(state.is_code_active("485102").await);
        assert_eq!(client.session_code().as_deref(), Some("485102"));
        assert_eq!(viewer.session_code().as_deref(), Some("485102"));
    }

    #[tokio::test]
    async fn client_register_without_reservation_is_invalid() {
        let state = SignalingState::new();
        let (client, _rx) = connect(&state).await;
        assert!(matches!(
            state.register_client("000000", &client, None).await,
            ClientRegister::InvalidCode
        ));
    }

    #[tokio::test]
    async fn claim_empties_pending_but_keeps_code_active() {
        let state = SignalingState::new();
        let (viewer, _rx) = connect(&state).await;
        state.reserve("123456", &viewer).await;
        let pending = state.claim("123456").await.unwrap();
        assert_eq!(pending.viewer.id(), viewer.id());
        assert!(!state.has_pending("123456").await);
        assert!(state.is_code_active("123456").await);
    }

    #[tokio::test]
    async fn release_clears_pending_and_active() {
        let state = SignalingState::new();
        let (viewer, _rx) = connect(&state).await;
        state.reserve("123456", &viewer).await;
        state.release("123456").await;
        assert!(!state.has_pending("123456").await);
        assert!(!state.is_code_active("123456").await);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_only_stale_pending_codes() {
        let state = SignalingState::new();
        let (viewer, _rx) = connect(&state).await;
        state.reserve("111111", &viewer).await;

        tokio::time::advance(PENDING_CODE_TTL + Duration::from_secs(60)).await;
        state.reserve("222222", &viewer).await;
        state.reap_expired(Instant::now()).await;

        assert!(!state.has_pending("111111").await);
        assert!(!state.is_code_active("111111").await);
        assert!(state.has_pending("222222").await);
        assert!(state.is_code_active("222222").await);
    }

    #[tokio::test]
    async fn second_viewer_is_refused_on_a_live_session() {
        let state = SignalingState::new();
        let (viewer, _v_rx) = connect(&state).await;
        let (client, _c_rx) = connect(&state).await;
        let (intruder, _i_rx) = connect(&state).await;

        state.reserve("485102", &viewer).await;
        state.register_client("485102", &client, None).await;

        assert!(matches!(
            state.register_viewer("485102", &intruder).await,
            ViewerRegister::Refused
        ));
        let session = state.session("485102").await.unwrap();
        assert_eq!(session.viewer().unwrap().id(), viewer.id());
    }

    #[tokio::test]
    async fn later_viewer_overwrites_a_pending_entry() {
        let state = SignalingState::new();
        let (first, _f_rx) = connect(&state).await;
        let (second, _s_rx) = connect(&state).await;

        state.reserve("485102", &first).await;
        assert!(matches!(
            state.register_viewer("485102", &second).await,
            ViewerRegister::PendingUpdated
        ));
        assert_eq!(state.claim("485102").await.unwrap().viewer.id(), second.id());
    }

    #[tokio::test]
    async fn detach_evicts_session_once_both_slots_drain() {
        let state = SignalingState::new();
        let (viewer, _v_rx) = connect(&state).await;
        let (client, _c_rx) = connect(&state).await;

        state.reserve("485102", &viewer).await;
        state.register_client("485102", &client, None).await;

        let outcome = state.detach("485102", &client).await.unwrap();
        assert_eq!(outcome.cleared, Some(Role::Client));
        assert_eq!(outcome.peer.unwrap().id(), viewer.id());
        assert!(!outcome.evicted);
        assert!(state.session("485102").await.is_some());

        let outcome = state.detach("485102", &viewer).await.unwrap();
        assert_eq!(outcome.cleared, Some(Role::Viewer));
        assert!(outcome.peer.is_none());
        assert!(outcome.evicted);
        assert!(state.session("485102").await.is_none());
        assert!(!state.is_code_active("485102").await);
    }

    #[tokio::test]
    async fn pending_viewer_disconnect_keeps_code_active() {
        let state = SignalingState::new();
        let (viewer, _rx) = connect(&state).await;
        state.reserve("485102", &viewer).await;

        assert!(state.drop_pending_for("485102", &viewer).await);
        assert!(!state.has_pending("485102").await);
        // The asymmetry of the close path: the code is not reclaimed here.
        assert!(state.is_code_active("485102").await);
    }

    #[tokio::test]
    async fn drop_pending_ignores_a_stranger() {
        let state = SignalingState::new();
        let (viewer, _v_rx) = connect(&state).await;
        let (other, _o_rx) = connect(&state).await;
        state.reserve("485102", &viewer).await;

        assert!(!state.drop_pending_for("485102", &other).await);
        assert!(state.has_pending("485102").await);
    }
}
