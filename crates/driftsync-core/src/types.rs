//! Core identifiers and session records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable unique identifier for a device
///
/// Device ids are assigned once per installation and never change, so
/// checkpoints and sessions keyed by them survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a DeviceId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random DeviceId
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a sync session
///
/// Uses ULID so session ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Create a new SessionId with the current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// A peer device as seen by discovery or manual registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable unique id of the device
    pub device_id: DeviceId,
    /// Human-readable device name
    pub device_name: String,
    /// Reachable address, present only when the peer was found on the LAN
    pub ip_address: Option<String>,
    /// When the device was last seen advertising
    pub last_seen: DateTime<Utc>,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with no network address
    pub fn new(device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            ip_address: None,
            last_seen: Utc::now(),
        }
    }

    /// Attach a LAN address (builder pattern)
    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.ip_address = Some(addr.into());
        self
    }

    /// Refresh the last-seen timestamp after a re-advertisement
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Transport used for a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMethod {
    /// Request/response exchange over the local network
    LocalNetwork,
    /// Negotiated peer-to-peer data channel
    RemotePeer,
    /// Manual transfer via displayed/scanned codes
    Manual,
}

impl std::fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMethod::LocalNetwork => write!(f, "local-network"),
            SyncMethod::RemotePeer => write!(f, "remote-peer"),
            SyncMethod::Manual => write!(f, "manual"),
        }
    }
}

/// Lifecycle state of a single sync session
///
/// Sessions move `Connecting -> Syncing -> Completed | Error` and never
/// leave a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Selecting a transport and preparing the exchange
    Connecting,
    /// Actively exchanging and applying deltas
    Syncing,
    /// Cycle finished successfully
    Completed,
    /// Cycle aborted with an error
    Error(String),
}

impl SessionStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error(_))
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Syncing => write!(f, "syncing"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Record of one sync attempt with one peer over one transport
///
/// Created at cycle start, updated monotonically, never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    /// Unique id of this session
    pub id: SessionId,
    /// The peer this session syncs with
    pub peer_id: DeviceId,
    /// Transport chosen for this cycle
    pub method: SyncMethod,
    /// Current lifecycle state
    pub status: SessionStatus,
    /// When the cycle started
    pub started_at: DateTime<Utc>,
    /// When the cycle reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Change units sent to the peer
    pub changes_sent: u64,
    /// Change units received and applied
    pub changes_received: u64,
    /// Error message when the session failed
    pub error: Option<String>,
}

impl SyncSession {
    /// Create a fresh session in the `Connecting` state
    pub fn new(peer_id: DeviceId, method: SyncMethod) -> Self {
        Self {
            id: SessionId::new(),
            peer_id,
            method,
            status: SessionStatus::Connecting,
            started_at: Utc::now(),
            completed_at: None,
            changes_sent: 0,
            changes_received: 0,
            error: None,
        }
    }
}
