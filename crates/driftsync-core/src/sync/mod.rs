//! Sync transports, wire protocol, and session tracking
//!
//! Three transports move the same wire messages: request/response over the
//! local network, a negotiated peer-to-peer channel, and manual transfer via
//! scanned codes. The engine picks one per cycle based on what can reach the
//! peer.

pub mod channel;
pub mod chunk;
pub mod lan;
pub mod manual;
pub mod protocol;
pub mod session;

pub use channel::{AnswerExchange, ChannelState, Connector, Negotiation, PeerChannel};
pub use chunk::{Chunk, ChunkAssembler, DEFAULT_CAPACITY};
pub use lan::{InboundRequest, LanEndpoint, PeerDiscovery};
pub use manual::{ManualTransport, ScanOutcome};
pub use protocol::{MessageKind, SyncMessage};
pub use session::{SessionPatch, SessionStore, SyncEvent, SyncStatus};

use crate::types::SyncMethod;

/// A concrete way to reach a peer for one sync cycle
///
/// Selection prefers the local network, then a negotiated channel, then
/// falls back to manual transfer.
pub enum Transport {
    /// Request/response against a reachable LAN address
    LocalNetwork {
        /// The peer's advertised address
        addr: String,
    },
    /// Negotiated peer channel, with the out-of-band answer path to use
    RemotePeer {
        /// Carries the offer out and the answer back
        exchange: AnswerExchange,
    },
    /// Code-based transfer driven by the embedder
    Manual,
}

impl Transport {
    /// The sync method this transport corresponds to
    pub fn method(&self) -> SyncMethod {
        match self {
            Transport::LocalNetwork { .. } => SyncMethod::LocalNetwork,
            Transport::RemotePeer { .. } => SyncMethod::RemotePeer,
            Transport::Manual => SyncMethod::Manual,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::LocalNetwork { addr } => {
                f.debug_struct("LocalNetwork").field("addr", addr).finish()
            }
            Transport::RemotePeer { .. } => f.debug_struct("RemotePeer").finish_non_exhaustive(),
            Transport::Manual => write!(f, "Manual"),
        }
    }
}
