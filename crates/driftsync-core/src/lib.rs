//! Driftsync Core Library
//!
//! Serverless device-to-device dataset synchronization over Automerge CRDTs.
//!
//! ## Overview
//!
//! Driftsync keeps one replicated dataset converging across a user's devices
//! without any central server. Each device tracks, per peer, what that peer
//! has already seen and sends only the missing changes. Exchanges run over
//! whichever transport can reach the peer: request/response on the local
//! network, a negotiated peer-to-peer channel, or codes displayed on one
//! screen and scanned by another.
//!
//! ## Core Principles
//!
//! - **Local-first**: devices edit offline and converge whenever they meet
//! - **Serverless**: every transport is device-to-device
//! - **Convergent**: deltas commute, so ordering and re-delivery never hurt
//!
//! ## Quick Start
//!
//! ```ignore
//! use driftsync_core::{DeviceId, EngineConfig, SyncDoc, SyncEngine, SyncOptions};
//! use driftsync_core::storage::RedbCheckpoints;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let checkpoints = Arc::new(RedbCheckpoints::new("~/.driftsync/checkpoints.redb")?);
//!     let engine = SyncEngine::new(DeviceId::generate(), EngineConfig::new(checkpoints));
//!     engine.initialize(SyncDoc::new()).await?;
//!
//!     engine.edit(|doc| doc.set_value("title", "groceries")).await?;
//!
//!     // No network? Render the delta as scannable frames instead.
//!     let (_session, frames) = engine.generate_manual_frames(&peer_id).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod changelog;
pub mod doc;
pub mod engine;
pub mod error;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use changelog::{ChangeLog, Delta};
pub use doc::SyncDoc;
pub use engine::{
    EngineConfig, ManualSyncOutcome, SyncEngine, SyncOptions, DEFAULT_SCAN_INTERVAL,
};
pub use error::{SyncError, SyncResult};
pub use storage::{CheckpointStore, MemoryCheckpoints, RedbCheckpoints};
pub use sync::{
    AnswerExchange, ChannelState, Chunk, ChunkAssembler, Connector, InboundRequest, LanEndpoint,
    ManualTransport, MessageKind, Negotiation, PeerChannel, PeerDiscovery, ScanOutcome,
    SessionPatch, SessionStore, SyncEvent, SyncMessage, SyncStatus, Transport, DEFAULT_CAPACITY,
};
pub use types::*;
