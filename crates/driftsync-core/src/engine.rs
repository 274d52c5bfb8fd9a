//! Main SyncEngine - the entry point for device-to-device dataset sync
//!
//! SyncEngine binds one replicated document to the three transports and
//! drives whole sync cycles: compute the delta a peer has not seen, exchange
//! messages, apply what came back, and checkpoint. No server is involved at
//! any point; every exchange is device to device.
//!
//! # Example
//!
//! ```ignore
//! use driftsync_core::{DeviceId, EngineConfig, SyncDoc, SyncEngine, SyncOptions};
//! use driftsync_core::storage::MemoryCheckpoints;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::new(Arc::new(MemoryCheckpoints::new()));
//! let engine = SyncEngine::new(DeviceId::generate(), config);
//! engine.initialize(SyncDoc::new()).await?;
//!
//! // Sync with a peer discovered on the LAN
//! let session = engine.sync_with_peer(&peer_id, SyncOptions::default()).await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::changelog::ChangeLog;
use crate::doc::SyncDoc;
use crate::error::{SyncError, SyncResult};
use crate::storage::CheckpointStore;
use crate::sync::{
    lan, AnswerExchange, ChunkAssembler, Connector, LanEndpoint, ManualTransport, PeerChannel,
    PeerDiscovery, ScanOutcome, SessionPatch, SessionStore, SyncEvent, SyncMessage, Transport,
};
use crate::types::{DeviceId, DeviceInfo, SessionId, SessionStatus, SyncMethod, SyncSession};

/// Default interval between discovery scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Wiring for a SyncEngine: checkpoint store plus optional transports
///
/// Every transport is optional; an engine with none of them can still drive
/// manual transfers.
pub struct EngineConfig {
    checkpoints: Arc<dyn CheckpointStore>,
    lan: Option<Arc<dyn LanEndpoint>>,
    discovery: Option<Arc<dyn PeerDiscovery>>,
    connector: Option<Arc<dyn Connector>>,
    manual: ManualTransport,
}

impl EngineConfig {
    /// Start a config from a checkpoint store
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            checkpoints,
            lan: None,
            discovery: None,
            connector: None,
            manual: ManualTransport::default(),
        }
    }

    /// Attach a local-network endpoint
    pub fn with_lan(mut self, lan: Arc<dyn LanEndpoint>) -> Self {
        self.lan = Some(lan);
        self
    }

    /// Attach peer discovery
    pub fn with_discovery(mut self, discovery: Arc<dyn PeerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Attach a peer-channel connector
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the manual transfer frame capacity
    pub fn with_manual_capacity(mut self, capacity: usize) -> Self {
        self.manual = ManualTransport::new(capacity);
        self
    }
}

/// Per-cycle options for [`SyncEngine::sync_with_peer`]
#[derive(Default)]
pub struct SyncOptions {
    transport: Option<Transport>,
    answer_exchange: Option<AnswerExchange>,
}

impl SyncOptions {
    /// Force a specific transport instead of automatic selection
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Provide the out-of-band answer path for peer-channel negotiation
    pub fn with_answer_exchange(mut self, exchange: AnswerExchange) -> Self {
        self.answer_exchange = Some(exchange);
        self
    }
}

/// Result of feeding one scanned frame into the engine
#[derive(Debug)]
pub enum ManualSyncOutcome {
    /// The frame completed a transfer and its changes were applied
    Applied(SyncSession),
    /// More chunks are still outstanding
    Pending {
        /// Unique chunks received so far
        received: usize,
        /// Total chunks the bundle declares
        total: usize,
    },
}

struct Inner {
    local_id: DeviceId,
    doc: tokio::sync::Mutex<Option<SyncDoc>>,
    changelog: ChangeLog,
    sessions: SessionStore,
    lan: Option<Arc<dyn LanEndpoint>>,
    discovery: Option<Arc<dyn PeerDiscovery>>,
    connector: Option<Arc<dyn Connector>>,
    manual: ManualTransport,
    in_flight: Mutex<HashSet<DeviceId>>,
    assembler: Mutex<ChunkAssembler>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

/// Removes the peer from the in-flight set when the cycle ends, however it ends
struct InFlightGuard {
    inner: Arc<Inner>,
    peer: DeviceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.peer);
    }
}

/// Coordinates delta computation, transports, sessions, and checkpoints
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Create an engine for the given local device
    ///
    /// The engine is inert until [`SyncEngine::initialize`] binds a document.
    pub fn new(local_id: DeviceId, config: EngineConfig) -> Self {
        info!(device = %local_id, "Creating sync engine");
        Self {
            inner: Arc::new(Inner {
                local_id,
                doc: tokio::sync::Mutex::new(None),
                changelog: ChangeLog::new(config.checkpoints),
                sessions: SessionStore::new(),
                lan: config.lan,
                discovery: config.discovery,
                connector: config.connector,
                manual: config.manual,
                in_flight: Mutex::new(HashSet::new()),
                assembler: Mutex::new(ChunkAssembler::new()),
                listener_task: Mutex::new(None),
                scan_task: Mutex::new(None),
            }),
        }
    }

    /// Bind the replicated document and start serving inbound requests
    ///
    /// Until this is called every document-touching operation returns
    /// `SyncError::NotInitialized`. Calling it again replaces the document.
    pub async fn initialize(&self, doc: SyncDoc) -> SyncResult<()> {
        *self.inner.doc.lock().await = Some(doc);
        self.spawn_lan_listener();
        info!(device = %self.inner.local_id, "Sync engine initialized");
        Ok(())
    }

    fn spawn_lan_listener(&self) {
        let Some(lan) = &self.inner.lan else { return };
        let Some(mut incoming) = lan.take_incoming() else { return };

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                match engine
                    .handle_inbound_message(&request.payload, SyncMethod::LocalNetwork)
                    .await
                {
                    Ok(reply) => request.respond(reply),
                    Err(e) => warn!(error = %e, "Dropped inbound sync request"),
                }
            }
        });
        *self.inner.listener_task.lock() = Some(handle);
    }

    /// The local device id
    pub fn local_id(&self) -> &DeviceId {
        &self.inner.local_id
    }

    /// The shared session and peer store
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.inner.sessions.subscribe()
    }

    async fn with_doc<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut SyncDoc) -> SyncResult<T>,
    {
        let mut guard = self.inner.doc.lock().await;
        let doc = guard.as_mut().ok_or(SyncError::NotInitialized)?;
        f(doc)
    }

    /// Run a closure against the bound document
    ///
    /// This is how embedders edit the dataset; edits become part of the next
    /// delta automatically.
    pub async fn edit<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut SyncDoc) -> SyncResult<T>,
    {
        self.with_doc(f).await
    }

    /// Save the full document state as a snapshot
    pub async fn snapshot(&self) -> SyncResult<Vec<u8>> {
        self.with_doc(|doc| Ok(doc.save())).await
    }

    /// Count the change units the peer has not yet seen
    pub async fn pending_changes_for(&self, peer: &DeviceId) -> SyncResult<usize> {
        let changelog = &self.inner.changelog;
        let delta = self
            .with_doc(|doc| changelog.compute_delta(doc, peer))
            .await?;
        Ok(delta.change_count)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport selection and sync cycles
    // ═══════════════════════════════════════════════════════════════════════

    /// Pick the best transport for a peer
    ///
    /// Prefers the local network when the peer has a known address, then a
    /// negotiated channel when an answer path is available, and falls back
    /// to manual transfer.
    pub fn select_transport(
        &self,
        peer: &DeviceId,
        exchange: Option<AnswerExchange>,
    ) -> Transport {
        if self.inner.lan.is_some() {
            if let Some(info) = self.inner.sessions.peer(peer) {
                if let Some(addr) = info.ip_address {
                    return Transport::LocalNetwork { addr };
                }
            }
        }
        if self.inner.connector.is_some() {
            if let Some(exchange) = exchange {
                return Transport::RemotePeer { exchange };
            }
        }
        Transport::Manual
    }

    fn begin_cycle(&self, peer: &DeviceId) -> SyncResult<InFlightGuard> {
        let mut in_flight = self.inner.in_flight.lock();
        if !in_flight.insert(peer.clone()) {
            return Err(SyncError::SyncInProgress(peer.to_string()));
        }
        Ok(InFlightGuard {
            inner: self.inner.clone(),
            peer: peer.clone(),
        })
    }

    /// Run one full sync cycle with a peer
    ///
    /// At most one cycle per peer runs at a time; a second call while one is
    /// in flight returns `SyncError::SyncInProgress`. The returned session is
    /// terminal: `Completed`, or the error is propagated with the session
    /// left in `Error`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::TransportUnavailable` when selection falls back
    /// to manual transfer, which is frame-driven through
    /// [`SyncEngine::generate_manual_frames`] instead.
    pub async fn sync_with_peer(
        &self,
        peer: &DeviceId,
        options: SyncOptions,
    ) -> SyncResult<SyncSession> {
        let transport = match options.transport {
            Some(transport) => transport,
            None => self.select_transport(peer, options.answer_exchange),
        };
        if matches!(transport, Transport::Manual) {
            return Err(SyncError::TransportUnavailable(format!(
                "{peer}: no network path; drive a manual transfer instead"
            )));
        }

        let _guard = self.begin_cycle(peer)?;
        let session = self
            .inner
            .sessions
            .start_session(peer.clone(), transport.method());
        debug!(session = %session.id, peer = %peer, transport = ?transport, "Starting sync cycle");

        let result = match transport {
            Transport::LocalNetwork { addr } => {
                self.run_lan_cycle(peer, &addr, &session.id).await
            }
            Transport::RemotePeer { exchange } => {
                self.run_channel_cycle(peer, exchange, &session.id).await
            }
            Transport::Manual => unreachable!("manual rejected above"),
        };

        match result {
            Ok(()) => self
                .inner
                .sessions
                .complete_session(&session.id)
                .ok_or_else(|| SyncError::Network("session vanished mid-cycle".to_string())),
            Err(e) => {
                self.inner.sessions.fail_session(&session.id, e.to_string());
                Err(e)
            }
        }
    }

    async fn run_lan_cycle(
        &self,
        peer: &DeviceId,
        addr: &str,
        session_id: &SessionId,
    ) -> SyncResult<()> {
        let endpoint = self
            .inner
            .lan
            .as_ref()
            .ok_or_else(|| SyncError::TransportUnavailable(peer.to_string()))?;

        let changelog = &self.inner.changelog;
        let delta = self
            .with_doc(|doc| changelog.compute_delta(doc, peer))
            .await?;
        self.inner.sessions.update_session(
            session_id,
            SessionPatch::status(SessionStatus::Syncing).add_sent(delta.change_count as u64),
        );

        let request = SyncMessage::request(self.inner.local_id.as_str(), delta.payload_opt());
        let reply = lan::request(endpoint.as_ref(), addr, &request).await?;

        let (applied, received) = self.apply_reply(&reply).await?;
        self.inner
            .sessions
            .update_session(session_id, SessionPatch::default().add_received(applied as u64));
        self.checkpoint_soft(peer, &delta.payload, &received);
        Ok(())
    }

    async fn run_channel_cycle(
        &self,
        peer: &DeviceId,
        exchange: AnswerExchange,
        session_id: &SessionId,
    ) -> SyncResult<()> {
        let connector = self
            .inner
            .connector
            .as_ref()
            .ok_or_else(|| SyncError::TransportUnavailable(peer.to_string()))?;

        let channel = PeerChannel::new(connector.connect(peer).await?);
        channel.open(&exchange).await?;

        let result = async {
            let changelog = &self.inner.changelog;
            let delta = self
                .with_doc(|doc| changelog.compute_delta(doc, peer))
                .await?;
            self.inner.sessions.update_session(
                session_id,
                SessionPatch::status(SessionStatus::Syncing)
                    .add_sent(delta.change_count as u64),
            );

            let request =
                SyncMessage::request(self.inner.local_id.as_str(), delta.payload_opt());
            channel.send(request.encode()?).await?;
            let reply = SyncMessage::decode(&channel.recv().await?)?;
            if !reply.kind.is_response() {
                return Err(SyncError::InvalidMessage(
                    "expected a sync-response reply".to_string(),
                ));
            }

            let (applied, received) = self.apply_reply(&reply).await?;
            self.inner.sessions.update_session(
                session_id,
                SessionPatch::default().add_received(applied as u64),
            );
            self.checkpoint_soft(peer, &delta.payload, &received);
            Ok(())
        }
        .await;

        let _ = channel.close().await;
        result
    }

    async fn apply_reply(&self, reply: &SyncMessage) -> SyncResult<(usize, Vec<u8>)> {
        match reply.changes_bytes()? {
            None => Ok((0, Vec::new())),
            Some(bytes) => {
                let changelog = &self.inner.changelog;
                let applied = self
                    .with_doc(|doc| changelog.apply_delta(doc, &bytes))
                    .await?;
                Ok((applied, bytes))
            }
        }
    }

    /// Checkpoint exactly the payloads that crossed the wire
    ///
    /// Never snapshots the live document: an edit landing mid-exchange was
    /// not sent, and checkpointing it would drop it from every future delta
    /// for this peer. Failure only costs bandwidth on the next cycle.
    fn checkpoint_soft(&self, peer: &DeviceId, sent: &[u8], received: &[u8]) {
        if let Err(e) = self
            .inner
            .changelog
            .save_exchange_checkpoint(peer, sent, received)
        {
            warn!(peer = %peer, error = %e, "Checkpoint save failed");
        }
    }

    /// Handle one inbound sync request, from any transport
    ///
    /// Applies the sender's delta, computes the reply delta from the old
    /// checkpoint, then advances the checkpoint. The responder records its
    /// own session for the exchange.
    async fn handle_inbound_message(
        &self,
        payload: &[u8],
        method: SyncMethod,
    ) -> SyncResult<Vec<u8>> {
        let message = SyncMessage::decode(payload)?;
        if !message.kind.is_request() {
            return Err(SyncError::InvalidMessage(
                "inbound message is not a sync-request".to_string(),
            ));
        }

        let peer = DeviceId::new(&message.device_id);
        let session = self.inner.sessions.start_session(peer.clone(), method);
        self.inner
            .sessions
            .update_session(&session.id, SessionPatch::status(SessionStatus::Syncing));

        let result = async {
            let changelog = &self.inner.changelog;
            let received = message.changes_bytes()?.unwrap_or_default();
            let applied = if received.is_empty() {
                0
            } else {
                self.with_doc(|doc| changelog.apply_delta(doc, &received))
                    .await?
            };

            // Reply with what the peer was missing before this exchange.
            let delta = self
                .with_doc(|doc| changelog.compute_delta(doc, &peer))
                .await?;
            self.inner.sessions.update_session(
                &session.id,
                SessionPatch::default()
                    .add_received(applied as u64)
                    .add_sent(delta.change_count as u64),
            );
            self.checkpoint_soft(&peer, &delta.payload, &received);

            SyncMessage::response(self.inner.local_id.as_str(), delta.payload_opt()).encode()
        }
        .await;

        match result {
            Ok(reply) => {
                self.inner.sessions.complete_session(&session.id);
                Ok(reply)
            }
            Err(e) => {
                self.inner.sessions.fail_session(&session.id, e.to_string());
                Err(e)
            }
        }
    }

    /// Accept a peer-channel offer as the responder
    ///
    /// Returns the answer token for the initiator and serves the exchange in
    /// the background.
    pub async fn accept_remote_peer(&self, peer: &DeviceId, offer: &str) -> SyncResult<String> {
        let connector = self
            .inner
            .connector
            .as_ref()
            .ok_or_else(|| SyncError::TransportUnavailable(peer.to_string()))?;

        let channel = PeerChannel::new(connector.connect(peer).await?);
        let answer = channel.accept(offer).await?;

        let engine = self.clone();
        tokio::spawn(async move {
            match channel.recv().await {
                Ok(payload) => {
                    match engine
                        .handle_inbound_message(&payload, SyncMethod::RemotePeer)
                        .await
                    {
                        Ok(reply) => {
                            if let Err(e) = channel.send(reply).await {
                                warn!(error = %e, "Failed to send channel reply");
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropped inbound channel request"),
                    }
                }
                Err(e) => warn!(error = %e, "Channel closed before a request arrived"),
            }
            let _ = channel.close().await;
        });

        Ok(answer)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Manual transfer
    // ═══════════════════════════════════════════════════════════════════════

    /// Render the delta for a peer as displayable frames
    ///
    /// The session completes as soon as the frames are handed over; whether
    /// the peer ever scans them is unknowable, so no checkpoint is advanced.
    pub async fn generate_manual_frames(
        &self,
        peer: &DeviceId,
    ) -> SyncResult<(SyncSession, Vec<String>)> {
        let session = self
            .inner
            .sessions
            .start_session(peer.clone(), SyncMethod::Manual);

        let result = async {
            let changelog = &self.inner.changelog;
            let delta = self
                .with_doc(|doc| changelog.compute_delta(doc, peer))
                .await?;
            self.inner.sessions.update_session(
                &session.id,
                SessionPatch::status(SessionStatus::Syncing)
                    .add_sent(delta.change_count as u64),
            );

            let message = SyncMessage::request(self.inner.local_id.as_str(), delta.payload_opt());
            self.inner.manual.encode_frames(&message)
        }
        .await;

        match result {
            Ok(frames) => {
                let session = self
                    .inner
                    .sessions
                    .complete_session(&session.id)
                    .ok_or_else(|| SyncError::Network("session vanished mid-cycle".to_string()))?;
                Ok((session, frames))
            }
            Err(e) => {
                self.inner.sessions.fail_session(&session.id, e.to_string());
                Err(e)
            }
        }
    }

    /// Feed one scanned frame into the engine
    ///
    /// Chunks accumulate across calls until their bundle completes; a
    /// completed transfer is applied to the document, checkpointed for the
    /// sending device, and recorded as a session. When `expected_peer` is
    /// given, a completed bundle from any other device is rejected before
    /// anything is applied.
    ///
    /// # Errors
    ///
    /// A frame from a different bundle than the one in progress returns
    /// `SyncError::InvalidChunk`; call
    /// [`SyncEngine::reset_manual_transfer`] to abandon the old bundle.
    /// A completed bundle whose sender does not match `expected_peer`
    /// returns `SyncError::InvalidMessage`.
    pub async fn apply_manual_frame(
        &self,
        frame: &str,
        expected_peer: Option<&DeviceId>,
    ) -> SyncResult<ManualSyncOutcome> {
        let outcome = {
            let mut assembler = self.inner.assembler.lock();
            self.inner.manual.decode_frame(frame, &mut assembler)?
        };

        let message = match outcome {
            ScanOutcome::Partial { received, total } => {
                debug!(received, total, "Manual transfer in progress");
                return Ok(ManualSyncOutcome::Pending { received, total });
            }
            ScanOutcome::Complete(message) => {
                *self.inner.assembler.lock() = ChunkAssembler::new();
                message
            }
        };

        let peer = DeviceId::new(&message.device_id);
        if let Some(expected) = expected_peer {
            if *expected != peer {
                return Err(SyncError::InvalidMessage(format!(
                    "scanned frames from {peer}, expected {expected}"
                )));
            }
        }

        let session = self
            .inner
            .sessions
            .start_session(peer.clone(), SyncMethod::Manual);
        self.inner
            .sessions
            .update_session(&session.id, SessionPatch::status(SessionStatus::Syncing));

        let result: Result<usize, SyncError> = async {
            let changelog = &self.inner.changelog;
            let received = message.changes_bytes()?.unwrap_or_default();
            let applied = if received.is_empty() {
                0
            } else {
                self.with_doc(|doc| changelog.apply_delta(doc, &received))
                    .await?
            };
            self.checkpoint_soft(&peer, &[], &received);
            Ok(applied)
        }
        .await;

        match result {
            Ok(applied) => {
                self.inner.sessions.update_session(
                    &session.id,
                    SessionPatch::default().add_received(applied as u64),
                );
                let session = self
                    .inner
                    .sessions
                    .complete_session(&session.id)
                    .ok_or_else(|| SyncError::Network("session vanished mid-cycle".to_string()))?;
                Ok(ManualSyncOutcome::Applied(session))
            }
            Err(e) => {
                self.inner.sessions.fail_session(&session.id, e.to_string());
                Err(e)
            }
        }
    }

    /// Abandon any in-progress manual transfer
    pub fn reset_manual_transfer(&self) {
        *self.inner.assembler.lock() = ChunkAssembler::new();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Discovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Advertise the local device and keep the peer roster fresh
    ///
    /// Scans at the given interval; peers that stop appearing are removed
    /// from the roster.
    pub async fn start_auto_discovery(
        &self,
        local: DeviceInfo,
        interval: Duration,
    ) -> SyncResult<()> {
        let discovery = self
            .inner
            .discovery
            .as_ref()
            .ok_or_else(|| {
                SyncError::TransportUnavailable("no discovery configured".to_string())
            })?
            .clone();

        discovery.advertise(&local).await?;
        info!(device = %local.device_id, "Started advertising");

        let sessions = self.inner.sessions.clone();
        let handle = tokio::spawn(async move {
            let mut seen: HashSet<DeviceId> = HashSet::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let found = match discovery.scan().await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(error = %e, "Discovery scan failed");
                        continue;
                    }
                };

                let mut current = HashSet::new();
                for info in found {
                    current.insert(info.device_id.clone());
                    sessions.add_peer(info);
                }
                for peer in seen.difference(&current) {
                    sessions.remove_peer(peer);
                }
                seen = current;
            }
        });

        if let Some(old) = self.inner.scan_task.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Stop advertising and scanning
    pub async fn stop_auto_discovery(&self) -> SyncResult<()> {
        if let Some(handle) = self.inner.scan_task.lock().take() {
            handle.abort();
        }
        if let Some(discovery) = &self.inner.discovery {
            discovery.stop().await?;
        }
        Ok(())
    }

    /// Stop background tasks and release the document
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.stop_auto_discovery().await?;
        if let Some(handle) = self.inner.listener_task.lock().take() {
            handle.abort();
        }
        *self.inner.doc.lock().await = None;
        info!(device = %self.inner.local_id, "Sync engine shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCheckpoints;

    fn engine() -> SyncEngine {
        SyncEngine::new(
            DeviceId::new("local"),
            EngineConfig::new(Arc::new(MemoryCheckpoints::new())),
        )
    }

    #[tokio::test]
    async fn test_uninitialized_engine_rejects_document_ops() {
        let engine = engine();
        assert!(matches!(
            engine.snapshot().await,
            Err(SyncError::NotInitialized)
        ));
        assert!(matches!(
            engine.pending_changes_for(&DeviceId::new("p")).await,
            Err(SyncError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_selection_falls_back_to_manual() {
        let engine = engine();
        let transport = engine.select_transport(&DeviceId::new("p"), None);
        assert!(matches!(transport, Transport::Manual));
    }

    #[tokio::test]
    async fn test_sync_without_network_path_fails() {
        let engine = engine();
        engine.initialize(SyncDoc::new()).await.unwrap();

        let result = engine
            .sync_with_peer(&DeviceId::new("p"), SyncOptions::default())
            .await;
        assert!(matches!(result, Err(SyncError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_edit_and_pending_changes() {
        let engine = engine();
        engine.initialize(SyncDoc::new()).await.unwrap();

        engine
            .edit(|doc| doc.set_value("title", "groceries"))
            .await
            .unwrap();
        let pending = engine
            .pending_changes_for(&DeviceId::new("p"))
            .await
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_manual_frames_roundtrip_between_engines() {
        let sender = engine();
        sender.initialize(SyncDoc::new()).await.unwrap();
        sender
            .edit(|doc| doc.set_value("item", "flour"))
            .await
            .unwrap();

        let receiver = SyncEngine::new(
            DeviceId::new("remote"),
            EngineConfig::new(Arc::new(MemoryCheckpoints::new())),
        );
        receiver.initialize(SyncDoc::new()).await.unwrap();

        let (session, frames) = sender
            .generate_manual_frames(&DeviceId::new("remote"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.changes_sent, 1);

        let mut last = None;
        for frame in &frames {
            last = Some(receiver.apply_manual_frame(frame, None).await.unwrap());
        }
        match last.unwrap() {
            ManualSyncOutcome::Applied(session) => {
                assert_eq!(session.peer_id.as_str(), "local");
                assert_eq!(session.changes_received, 1);
            }
            other => panic!("expected Applied, got {other:?}"),
        }

        let value = receiver
            .edit(|doc| doc.get_value("item"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("flour"));
    }

    #[tokio::test]
    async fn test_reset_manual_transfer_clears_partial_bundle() {
        let sender = SyncEngine::new(
            DeviceId::new("local"),
            EngineConfig::new(Arc::new(MemoryCheckpoints::new())).with_manual_capacity(300),
        );
        sender.initialize(SyncDoc::new()).await.unwrap();
        sender
            .edit(|doc| {
                for i in 0..40 {
                    doc.set_value(&format!("key-{i}"), "some value with a bit of length")?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let receiver = SyncEngine::new(
            DeviceId::new("remote"),
            EngineConfig::new(Arc::new(MemoryCheckpoints::new())).with_manual_capacity(300),
        );
        receiver.initialize(SyncDoc::new()).await.unwrap();

        let (_, frames) = sender
            .generate_manual_frames(&DeviceId::new("remote"))
            .await
            .unwrap();
        assert!(frames.len() > 1);

        let outcome = receiver.apply_manual_frame(&frames[0], None).await.unwrap();
        assert!(matches!(outcome, ManualSyncOutcome::Pending { received: 1, .. }));

        receiver.reset_manual_transfer();

        // A fresh bundle is accepted from scratch after the reset.
        let (_, frames) = sender
            .generate_manual_frames(&DeviceId::new("remote"))
            .await
            .unwrap();
        let outcome = receiver.apply_manual_frame(&frames[0], None).await.unwrap();
        assert!(matches!(outcome, ManualSyncOutcome::Pending { received: 1, .. }));
    }

    #[tokio::test]
    async fn test_manual_apply_checkpoints_the_sender() {
        let sender = engine();
        sender.initialize(SyncDoc::new()).await.unwrap();
        sender
            .edit(|doc| doc.set_value("item", "flour"))
            .await
            .unwrap();

        let receiver = SyncEngine::new(
            DeviceId::new("remote"),
            EngineConfig::new(Arc::new(MemoryCheckpoints::new())),
        );
        receiver.initialize(SyncDoc::new()).await.unwrap();
        receiver
            .edit(|doc| doc.set_value("own", "note"))
            .await
            .unwrap();

        let (_, frames) = sender
            .generate_manual_frames(&DeviceId::new("remote"))
            .await
            .unwrap();
        for frame in &frames {
            receiver.apply_manual_frame(frame, None).await.unwrap();
        }

        // The reply bundle only carries the receiver's own change, not an
        // echo of what was just scanned.
        let pending = receiver
            .pending_changes_for(&DeviceId::new("local"))
            .await
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_manual_frame_from_unexpected_sender_is_rejected() {
        let sender = engine();
        sender.initialize(SyncDoc::new()).await.unwrap();
        sender
            .edit(|doc| doc.set_value("item", "flour"))
            .await
            .unwrap();

        let receiver = SyncEngine::new(
            DeviceId::new("remote"),
            EngineConfig::new(Arc::new(MemoryCheckpoints::new())),
        );
        receiver.initialize(SyncDoc::new()).await.unwrap();

        let (_, frames) = sender
            .generate_manual_frames(&DeviceId::new("remote"))
            .await
            .unwrap();
        let result = receiver
            .apply_manual_frame(&frames[0], Some(&DeviceId::new("someone-else")))
            .await;
        assert!(matches!(result, Err(SyncError::InvalidMessage(_))));

        // Nothing was applied.
        let value = receiver.edit(|doc| doc.get_value("item")).await.unwrap();
        assert_eq!(value, None);
        assert!(receiver.sessions().sessions().is_empty());
    }
}
