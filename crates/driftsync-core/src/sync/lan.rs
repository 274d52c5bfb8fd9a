//! Local-network transport seam
//!
//! The engine talks to the LAN through two narrow traits: `LanEndpoint`
//! carries one request/response exchange to a peer address, `PeerDiscovery`
//! advertises the local device and scans for others. Platform integrations
//! (mDNS, UDP broadcast, an HTTP listener) implement these; the in-process
//! implementations here back the tests and keep the seams honest.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::SyncMessage;
use crate::types::DeviceInfo;

const INBOUND_QUEUE_DEPTH: usize = 16;

/// A request received from a peer, with a handle to reply on
#[derive(Debug)]
pub struct InboundRequest {
    /// Encoded request message as received
    pub payload: Vec<u8>,
    /// One-shot reply channel back to the requester
    pub reply: oneshot::Sender<Vec<u8>>,
}

impl InboundRequest {
    /// Send the reply payload back to the requester
    ///
    /// A requester that gave up waiting is not an error.
    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.reply.send(payload);
    }
}

/// Request/response exchange with peers on the local network
#[async_trait]
pub trait LanEndpoint: Send + Sync {
    /// Send a request payload to a peer address and wait for its reply
    async fn exchange(&self, addr: &str, payload: Vec<u8>) -> SyncResult<Vec<u8>>;

    /// Take the stream of inbound requests addressed to this endpoint
    ///
    /// Yields `Some` exactly once; the engine owns the receiver afterwards.
    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundRequest>>;
}

/// Advertising and scanning for peers on the local network
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Start advertising the local device
    async fn advertise(&self, local: &DeviceInfo) -> SyncResult<()>;

    /// Scan for currently advertising peers
    async fn scan(&self) -> SyncResult<Vec<DeviceInfo>>;

    /// Stop advertising and scanning
    async fn stop(&self) -> SyncResult<()>;
}

/// Perform one sync exchange with the peer at `addr`
///
/// # Errors
///
/// Returns `SyncError::Network` when the peer is unreachable and
/// `SyncError::InvalidMessage` when the reply is not a sync response.
pub async fn request(
    endpoint: &dyn LanEndpoint,
    addr: &str,
    message: &SyncMessage,
) -> SyncResult<SyncMessage> {
    debug!(addr, "Sending sync request");
    let reply = endpoint.exchange(addr, message.encode()?).await?;
    let reply = SyncMessage::decode(&reply)?;
    if !reply.kind.is_response() {
        return Err(SyncError::InvalidMessage(
            "expected a sync-response reply".to_string(),
        ));
    }
    Ok(reply)
}

/// In-process network of endpoints, addressed by name
///
/// Every endpoint created from one hub can reach every other. Used by tests
/// and by embedders that run multiple datasets in one process.
#[derive(Clone, Default)]
pub struct InProcessLanHub {
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<InboundRequest>>>>,
}

impl InProcessLanHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint listening at `addr`
    pub fn endpoint(&self, addr: impl Into<String>) -> InProcessLan {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.routes.lock().insert(addr.into(), tx);
        InProcessLan {
            hub: self.clone(),
            incoming: Mutex::new(Some(rx)),
        }
    }
}

/// An endpoint on an [`InProcessLanHub`]
pub struct InProcessLan {
    hub: InProcessLanHub,
    incoming: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
}

#[async_trait]
impl LanEndpoint for InProcessLan {
    async fn exchange(&self, addr: &str, payload: Vec<u8>) -> SyncResult<Vec<u8>> {
        let route = self.hub.routes.lock().get(addr).cloned();
        let Some(route) = route else {
            return Err(SyncError::Network(format!("no endpoint at {addr}")));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        route
            .send(InboundRequest {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SyncError::Network(format!("endpoint at {addr} stopped listening")))?;
        reply_rx
            .await
            .map_err(|_| SyncError::Network(format!("{addr} dropped the request")))
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<InboundRequest>> {
        self.incoming.lock().take()
    }
}

/// Discovery over a fixed peer list
///
/// Stands in for platform discovery in tests and in deployments where peers
/// are configured rather than discovered.
#[derive(Clone, Default)]
pub struct StaticDiscovery {
    peers: Arc<RwLock<Vec<DeviceInfo>>>,
}

impl StaticDiscovery {
    /// Create discovery over the given peers
    pub fn new(peers: Vec<DeviceInfo>) -> Self {
        Self {
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    /// Replace the peer list
    pub fn set_peers(&self, peers: Vec<DeviceInfo>) {
        *self.peers.write() = peers;
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn advertise(&self, _local: &DeviceInfo) -> SyncResult<()> {
        Ok(())
    }

    async fn scan(&self) -> SyncResult<Vec<DeviceInfo>> {
        Ok(self.peers.read().clone())
    }

    async fn stop(&self) -> SyncResult<()> {
        Ok(())
    }
}
