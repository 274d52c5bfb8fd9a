//! Session records, peer roster, and the sync event stream
//!
//! `SessionStore` is the shared mutable state behind the engine: every sync
//! cycle writes its session record here, and every observer subscribes here.
//! Handles are cheap to clone and safe to share across tasks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{DeviceId, DeviceInfo, SessionId, SessionStatus, SyncMethod, SyncSession};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Sessions kept before the oldest terminal records are evicted
const MAX_RETAINED_SESSIONS: usize = 64;

/// Events emitted as peers appear and sync sessions progress
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer was discovered or re-registered
    PeerDiscovered(DeviceInfo),
    /// A peer stopped advertising or was removed
    PeerLost(DeviceId),
    /// A sync cycle started
    SessionStarted(SyncSession),
    /// A running session changed state or counters
    SessionUpdated(SyncSession),
    /// A sync cycle finished successfully
    SessionCompleted(SyncSession),
    /// A sync cycle aborted with an error
    SessionFailed(SyncSession),
}

/// Coarse store-wide view of sync activity, derived from the latest session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No session has run yet
    Idle,
    /// The latest session is still connecting
    Connecting,
    /// The latest session is exchanging deltas
    Syncing,
    /// The latest session completed
    Completed,
    /// The latest session failed
    Error,
}

/// A partial update to a running session
///
/// Counters only ever grow; absent fields are left untouched.
#[derive(Debug, Default)]
pub struct SessionPatch {
    status: Option<SessionStatus>,
    add_sent: u64,
    add_received: u64,
}

impl SessionPatch {
    /// Patch that moves the session to a new status
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Add change units sent to the peer
    pub fn add_sent(mut self, count: u64) -> Self {
        self.add_sent += count;
        self
    }

    /// Add change units received and applied
    pub fn add_received(mut self, count: u64) -> Self {
        self.add_received += count;
        self
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SyncSession>,
    peers: HashMap<DeviceId, DeviceInfo>,
    last_sync: HashMap<DeviceId, DateTime<Utc>>,
}

impl Inner {
    /// Evict the oldest terminal sessions past the retention cap
    ///
    /// Running sessions are never evicted, so the map can briefly exceed the
    /// cap while many cycles are in flight.
    fn prune_sessions(&mut self) {
        if self.sessions.len() <= MAX_RETAINED_SESSIONS {
            return;
        }
        let mut terminal: Vec<(DateTime<Utc>, SessionId)> = self
            .sessions
            .values()
            .filter(|s| s.status.is_terminal())
            .map(|s| (s.started_at, s.id.clone()))
            .collect();
        terminal.sort_by_key(|(started, _)| *started);

        let excess = self.sessions.len() - MAX_RETAINED_SESSIONS;
        for (_, id) in terminal.into_iter().take(excess) {
            self.sessions.remove(&id);
        }
    }
}

/// Shared store of sessions, known peers, and last-sync times
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    /// Subscribe to sync events
    ///
    /// Slow subscribers may observe lagged receives; events are advisory and
    /// the store itself is always the source of truth.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Create and register a new session in the `Connecting` state
    ///
    /// Old terminal session records past the retention cap are evicted here.
    pub fn start_session(&self, peer_id: DeviceId, method: SyncMethod) -> SyncSession {
        let session = SyncSession::new(peer_id, method);
        {
            let mut inner = self.inner.write();
            inner.sessions.insert(session.id.clone(), session.clone());
            inner.prune_sessions();
        }
        debug!(session = %session.id, peer = %session.peer_id, method = %method, "Session started");
        self.emit(SyncEvent::SessionStarted(session.clone()));
        session
    }

    /// Apply a patch to a running session
    ///
    /// Updates against a terminal session are dropped; sessions never leave
    /// `Completed` or `Error`. Returns the session after the patch, or `None`
    /// for an unknown id.
    pub fn update_session(&self, id: &SessionId, patch: SessionPatch) -> Option<SyncSession> {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.sessions.get_mut(id)?;
            if session.status.is_terminal() {
                debug!(session = %id, "Ignoring update to terminal session");
                return Some(session.clone());
            }
            if let Some(status) = patch.status {
                session.status = status;
            }
            session.changes_sent += patch.add_sent;
            session.changes_received += patch.add_received;
            session.clone()
        };
        self.emit(SyncEvent::SessionUpdated(session.clone()));
        Some(session)
    }

    /// Move a session to `Completed` and record the peer's last-sync time
    pub fn complete_session(&self, id: &SessionId) -> Option<SyncSession> {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.sessions.get_mut(id)?;
            if session.status.is_terminal() {
                return Some(session.clone());
            }
            session.status = SessionStatus::Completed;
            session.completed_at = Some(Utc::now());
            let session = session.clone();
            inner
                .last_sync
                .insert(session.peer_id.clone(), session.completed_at.unwrap_or_else(Utc::now));
            session
        };
        debug!(
            session = %session.id,
            peer = %session.peer_id,
            sent = session.changes_sent,
            received = session.changes_received,
            "Session completed"
        );
        self.emit(SyncEvent::SessionCompleted(session.clone()));
        Some(session)
    }

    /// Move a session to `Error` with the given message
    pub fn fail_session(&self, id: &SessionId, error: impl Into<String>) -> Option<SyncSession> {
        let error = error.into();
        let session = {
            let mut inner = self.inner.write();
            let session = inner.sessions.get_mut(id)?;
            if session.status.is_terminal() {
                return Some(session.clone());
            }
            session.status = SessionStatus::Error(error.clone());
            session.error = Some(error);
            session.completed_at = Some(Utc::now());
            session.clone()
        };
        debug!(session = %session.id, peer = %session.peer_id, error = ?session.error, "Session failed");
        self.emit(SyncEvent::SessionFailed(session.clone()));
        Some(session)
    }

    /// Look up a session by id
    pub fn session(&self, id: &SessionId) -> Option<SyncSession> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// All sessions, most recent first
    pub fn sessions(&self) -> Vec<SyncSession> {
        let mut sessions: Vec<_> = self.inner.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    /// Whether any non-terminal session exists for the peer
    pub fn has_active_session(&self, peer: &DeviceId) -> bool {
        self.inner
            .read()
            .sessions
            .values()
            .any(|s| &s.peer_id == peer && !s.status.is_terminal())
    }

    /// Register or refresh a peer
    ///
    /// Re-registering refreshes the last-seen time, name, and address
    /// without emitting a duplicate discovery event. An advertisement with
    /// no address leaves a previously known address in place.
    pub fn add_peer(&self, info: DeviceInfo) {
        let is_new = {
            let mut inner = self.inner.write();
            match inner.peers.get_mut(&info.device_id) {
                Some(known) => {
                    known.device_name = info.device_name.clone();
                    if info.ip_address.is_some() {
                        known.ip_address = info.ip_address.clone();
                    }
                    known.touch();
                    false
                }
                None => {
                    inner.peers.insert(info.device_id.clone(), info.clone());
                    true
                }
            }
        };
        if is_new {
            debug!(peer = %info.device_id, name = %info.device_name, "Peer discovered");
            self.emit(SyncEvent::PeerDiscovered(info));
        }
    }

    /// Remove a peer from the roster
    pub fn remove_peer(&self, peer: &DeviceId) {
        let removed = self.inner.write().peers.remove(peer).is_some();
        if removed {
            debug!(peer = %peer, "Peer lost");
            self.emit(SyncEvent::PeerLost(peer.clone()));
        }
    }

    /// Look up a known peer
    pub fn peer(&self, peer: &DeviceId) -> Option<DeviceInfo> {
        self.inner.read().peers.get(peer).cloned()
    }

    /// All currently known peers
    pub fn peers(&self) -> Vec<DeviceInfo> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// When the peer last completed a sync with us, if ever
    pub fn last_sync(&self, peer: &DeviceId) -> Option<DateTime<Utc>> {
        self.inner.read().last_sync.get(peer).copied()
    }

    fn latest_session(&self) -> Option<SyncSession> {
        self.inner
            .read()
            .sessions
            .values()
            .max_by_key(|s| s.started_at)
            .cloned()
    }

    /// Coarse sync status, derived from the most recent session
    pub fn status(&self) -> SyncStatus {
        match self.latest_session() {
            None => SyncStatus::Idle,
            Some(session) => match session.status {
                SessionStatus::Connecting => SyncStatus::Connecting,
                SessionStatus::Syncing => SyncStatus::Syncing,
                SessionStatus::Completed => SyncStatus::Completed,
                SessionStatus::Error(_) => SyncStatus::Error,
            },
        }
    }

    /// Transport method of the most recent non-terminal session, if any
    pub fn active_method(&self) -> Option<SyncMethod> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .max_by_key(|s| s.started_at)
            .map(|s| s.method)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[test]
    fn test_session_lifecycle_success() {
        let store = SessionStore::new();
        let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        assert_eq!(session.status, SessionStatus::Connecting);

        let session = store
            .update_session(
                &session.id,
                SessionPatch::status(SessionStatus::Syncing).add_sent(3),
            )
            .unwrap();
        assert_eq!(session.status, SessionStatus::Syncing);
        assert_eq!(session.changes_sent, 3);

        let session = store.complete_session(&session.id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
        assert_eq!(store.last_sync(&peer("p1")), session.completed_at);
    }

    #[test]
    fn test_coarse_status_tracks_latest_session() {
        let store = SessionStore::new();
        assert_eq!(store.status(), SyncStatus::Idle);
        assert!(store.active_method().is_none());

        let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        assert_eq!(store.status(), SyncStatus::Connecting);
        assert_eq!(store.active_method(), Some(SyncMethod::LocalNetwork));

        store.update_session(&session.id, SessionPatch::status(SessionStatus::Syncing));
        assert_eq!(store.status(), SyncStatus::Syncing);

        store.complete_session(&session.id);
        assert_eq!(store.status(), SyncStatus::Completed);
        assert!(store.active_method().is_none());
    }

    #[test]
    fn test_session_lifecycle_failure() {
        let store = SessionStore::new();
        let session = store.start_session(peer("p1"), SyncMethod::Manual);
        let session = store.fail_session(&session.id, "peer unreachable").unwrap();

        assert_eq!(
            session.status,
            SessionStatus::Error("peer unreachable".into())
        );
        assert_eq!(session.error.as_deref(), Some("peer unreachable"));
        assert!(store.last_sync(&peer("p1")).is_none());
    }

    #[test]
    fn test_terminal_sessions_never_change() {
        let store = SessionStore::new();
        let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        store.complete_session(&session.id).unwrap();

        let after = store
            .update_session(
                &session.id,
                SessionPatch::status(SessionStatus::Syncing).add_received(9),
            )
            .unwrap();
        assert_eq!(after.status, SessionStatus::Completed);
        assert_eq!(after.changes_received, 0);

        let after = store.fail_session(&session.id, "late error").unwrap();
        assert_eq!(after.status, SessionStatus::Completed);
        assert!(after.error.is_none());
    }

    #[test]
    fn test_counters_accumulate() {
        let store = SessionStore::new();
        let session = store.start_session(peer("p1"), SyncMethod::RemotePeer);

        store
            .update_session(&session.id, SessionPatch::default().add_sent(2))
            .unwrap();
        let session = store
            .update_session(
                &session.id,
                SessionPatch::default().add_sent(1).add_received(4),
            )
            .unwrap();
        assert_eq!(session.changes_sent, 3);
        assert_eq!(session.changes_received, 4);
    }

    #[test]
    fn test_has_active_session_per_peer() {
        let store = SessionStore::new();
        assert!(!store.has_active_session(&peer("p1")));

        let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        assert!(store.has_active_session(&peer("p1")));
        assert!(!store.has_active_session(&peer("p2")));

        store.complete_session(&session.id);
        assert!(!store.has_active_session(&peer("p1")));
    }

    #[test]
    fn test_sessions_most_recent_first() {
        let store = SessionStore::new();
        let first = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.start_session(peer("p2"), SyncMethod::Manual);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, second.id);
        assert_eq!(sessions[1].id, first.id);
    }

    #[test]
    fn test_peer_roster() {
        let store = SessionStore::new();
        store.add_peer(DeviceInfo::new(peer("p1"), "Tablet").with_address("10.0.0.5:7675"));
        assert_eq!(store.peers().len(), 1);
        assert_eq!(
            store.peer(&peer("p1")).unwrap().ip_address.as_deref(),
            Some("10.0.0.5:7675")
        );

        store.remove_peer(&peer("p1"));
        assert!(store.peer(&peer("p1")).is_none());
        assert!(store.peers().is_empty());
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let store = SessionStore::new();
        let mut events = store.subscribe();

        store.add_peer(DeviceInfo::new(peer("p1"), "Tablet"));
        let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        store.update_session(&session.id, SessionPatch::status(SessionStatus::Syncing));
        store.complete_session(&session.id);
        store.remove_peer(&peer("p1"));

        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::PeerDiscovered(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::SessionStarted(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::SessionUpdated(s) if s.status == SessionStatus::Syncing
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::SessionCompleted(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::PeerLost(_)
        ));
    }

    #[tokio::test]
    async fn test_readd_known_peer_is_silent_refresh() {
        let store = SessionStore::new();
        store.add_peer(DeviceInfo::new(peer("p1"), "Tablet"));
        let seen_before = store.peer(&peer("p1")).unwrap().last_seen;
        std::thread::sleep(std::time::Duration::from_millis(2));

        let mut events = store.subscribe();
        store.add_peer(DeviceInfo::new(peer("p1"), "Tablet").with_address("10.0.0.9:7675"));

        let refreshed = store.peer(&peer("p1")).unwrap();
        assert_eq!(refreshed.ip_address.as_deref(), Some("10.0.0.9:7675"));
        assert!(refreshed.last_seen > seen_before);
        assert!(events.try_recv().is_err());

        // An advertisement without an address keeps the known one.
        store.add_peer(DeviceInfo::new(peer("p1"), "Tablet"));
        assert_eq!(
            store.peer(&peer("p1")).unwrap().ip_address.as_deref(),
            Some("10.0.0.9:7675")
        );
    }

    #[test]
    fn test_old_terminal_sessions_are_pruned() {
        let store = SessionStore::new();
        let first = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
        store.complete_session(&first.id);

        for _ in 0..(MAX_RETAINED_SESSIONS + 10) {
            let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
            store.complete_session(&session.id);
        }

        assert_eq!(store.sessions().len(), MAX_RETAINED_SESSIONS);
        // The oldest record went first.
        assert!(store.session(&first.id).is_none());
    }

    #[test]
    fn test_running_sessions_survive_pruning() {
        let store = SessionStore::new();
        let active = store.start_session(peer("p0"), SyncMethod::Manual);

        for _ in 0..(MAX_RETAINED_SESSIONS + 10) {
            let session = store.start_session(peer("p1"), SyncMethod::LocalNetwork);
            store.complete_session(&session.id);
        }

        let survivor = store.session(&active.id).unwrap();
        assert_eq!(survivor.status, SessionStatus::Connecting);
    }
}
