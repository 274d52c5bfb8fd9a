//! Negotiated peer-to-peer data channel
//!
//! Opening a channel is an offer/answer handshake: the initiator creates an
//! offer, carries it to the responder over some out-of-band path (a rendezvous
//! service, a pasted string), and feeds the answer back. `PeerChannel` drives
//! the handshake and tracks channel state; the `Negotiation` trait is the seam
//! platform integrations implement.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use ulid::Ulid;

use crate::error::{SyncError, SyncResult};
use crate::types::DeviceId;

/// Lifecycle of a peer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, handshake not started
    Idle,
    /// Offer/answer exchange in flight
    Negotiating,
    /// Handshake complete, payloads may flow
    Open,
    /// Closed, permanently
    Closed,
}

/// Carries an offer to the remote peer and returns its answer
///
/// The transport for this leg is the caller's concern; it may be a signaling
/// server, a shared clipboard, or an in-process responder in tests.
pub type AnswerExchange = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = SyncResult<String>> + Send>> + Send + Sync,
>;

/// Offer/answer negotiation and payload transfer for one channel
#[async_trait]
pub trait Negotiation: Send + Sync {
    /// Create the initiator's offer token
    async fn create_offer(&self) -> SyncResult<String>;

    /// Accept a remote offer and produce the answer token
    async fn accept_offer(&self, offer: &str) -> SyncResult<String>;

    /// Complete the handshake with the remote answer
    async fn accept_answer(&self, answer: &str) -> SyncResult<()>;

    /// Send a payload over the open channel
    async fn send(&self, payload: Vec<u8>) -> SyncResult<()>;

    /// Receive the next payload from the peer
    async fn recv(&self) -> SyncResult<Vec<u8>>;

    /// Tear the channel down
    async fn close(&self) -> SyncResult<()>;
}

/// Produces a negotiation for a given peer
#[async_trait]
pub trait Connector: Send + Sync {
    /// Set up a fresh negotiation toward `peer`
    async fn connect(&self, peer: &DeviceId) -> SyncResult<Arc<dyn Negotiation>>;
}

/// A peer channel with explicit handshake state
pub struct PeerChannel {
    negotiation: Arc<dyn Negotiation>,
    state: Mutex<ChannelState>,
}

impl PeerChannel {
    /// Wrap a negotiation in an idle channel
    pub fn new(negotiation: Arc<dyn Negotiation>) -> Self {
        Self {
            negotiation,
            state: Mutex::new(ChannelState::Idle),
        }
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> SyncResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(SyncError::NegotiationFailed(format!(
                "channel is {:?}, expected {:?}",
                *state, from
            )));
        }
        *state = to;
        Ok(())
    }

    /// Run the initiator side of the handshake
    ///
    /// Creates an offer, carries it through `exchange`, and completes with
    /// the returned answer. There is no timeout here; callers wanting one
    /// wrap the future.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NegotiationFailed` when the handshake cannot
    /// complete; the channel ends up `Closed`.
    pub async fn open(&self, exchange: &AnswerExchange) -> SyncResult<()> {
        self.transition(ChannelState::Idle, ChannelState::Negotiating)?;
        debug!("Opening peer channel");

        let result = async {
            let offer = self.negotiation.create_offer().await?;
            let answer = exchange(offer).await?;
            self.negotiation.accept_answer(&answer).await
        }
        .await;

        match result {
            Ok(()) => {
                *self.state.lock() = ChannelState::Open;
                debug!("Peer channel open");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = ChannelState::Closed;
                Err(SyncError::NegotiationFailed(e.to_string()))
            }
        }
    }

    /// Run the responder side of the handshake
    ///
    /// Returns the answer token the initiator needs to complete its side.
    pub async fn accept(&self, offer: &str) -> SyncResult<String> {
        self.transition(ChannelState::Idle, ChannelState::Negotiating)?;
        debug!("Accepting peer channel offer");

        match self.negotiation.accept_offer(offer).await {
            Ok(answer) => {
                *self.state.lock() = ChannelState::Open;
                debug!("Peer channel open");
                Ok(answer)
            }
            Err(e) => {
                *self.state.lock() = ChannelState::Closed;
                Err(SyncError::NegotiationFailed(e.to_string()))
            }
        }
    }

    fn ensure_open(&self) -> SyncResult<()> {
        let state = *self.state.lock();
        if state != ChannelState::Open {
            return Err(SyncError::NegotiationFailed(format!(
                "channel is {state:?}, expected Open"
            )));
        }
        Ok(())
    }

    /// Send a payload over the open channel
    pub async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.ensure_open()?;
        self.negotiation.send(payload).await
    }

    /// Receive the next payload from the peer
    pub async fn recv(&self) -> SyncResult<Vec<u8>> {
        self.ensure_open()?;
        self.negotiation.recv().await
    }

    /// Close the channel
    ///
    /// Closing an already-closed channel is a no-op.
    pub async fn close(&self) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return Ok(());
            }
            *state = ChannelState::Closed;
        }
        debug!("Peer channel closed");
        self.negotiation.close().await
    }
}

const OFFER_PREFIX: &str = "offer:";
const ANSWER_PREFIX: &str = "answer:";

/// In-process negotiation endpoint, created in linked pairs
///
/// Simulates the offer/answer handshake with matching tokens and moves
/// payloads over in-memory queues. Backs the tests for everything above the
/// transport seam.
pub struct InProcessNegotiation {
    session_token: String,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Create a linked pair of in-process negotiations
pub fn in_process_pair() -> (Arc<InProcessNegotiation>, Arc<InProcessNegotiation>) {
    let token = Ulid::new().to_string().to_lowercase();
    let (a_tx, b_rx) = mpsc::channel(16);
    let (b_tx, a_rx) = mpsc::channel(16);
    (
        Arc::new(InProcessNegotiation {
            session_token: token.clone(),
            outbound: a_tx,
            inbound: tokio::sync::Mutex::new(a_rx),
        }),
        Arc::new(InProcessNegotiation {
            session_token: token,
            outbound: b_tx,
            inbound: tokio::sync::Mutex::new(b_rx),
        }),
    )
}

#[async_trait]
impl Negotiation for InProcessNegotiation {
    async fn create_offer(&self) -> SyncResult<String> {
        Ok(format!("{OFFER_PREFIX}{}", self.session_token))
    }

    async fn accept_offer(&self, offer: &str) -> SyncResult<String> {
        let token = offer
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| SyncError::NegotiationFailed("not an offer token".to_string()))?;
        if token != self.session_token {
            return Err(SyncError::NegotiationFailed(
                "offer is for a different session".to_string(),
            ));
        }
        Ok(format!("{ANSWER_PREFIX}{}", self.session_token))
    }

    async fn accept_answer(&self, answer: &str) -> SyncResult<()> {
        let token = answer
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| SyncError::NegotiationFailed("not an answer token".to_string()))?;
        if token != self.session_token {
            return Err(SyncError::NegotiationFailed(
                "answer is for a different session".to_string(),
            ));
        }
        Ok(())
    }

    async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| SyncError::Network("peer side closed".to_string()))
    }

    async fn recv(&self) -> SyncResult<Vec<u8>> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SyncError::Network("peer side closed".to_string()))
    }

    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Connector that hands out a pre-wired negotiation regardless of peer
pub struct StaticConnector {
    negotiation: Arc<dyn Negotiation>,
}

impl StaticConnector {
    /// Create a connector around a fixed negotiation
    pub fn new(negotiation: Arc<dyn Negotiation>) -> Self {
        Self { negotiation }
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self, _peer: &DeviceId) -> SyncResult<Arc<dyn Negotiation>> {
        Ok(self.negotiation.clone())
    }
}
