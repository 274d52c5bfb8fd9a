//! Delta extraction and application against per-peer checkpoints
//!
//! `ChangeLog` computes the set of changes a peer has not yet seen, applies
//! inbound change sets, and records checkpoints after successful merges.
//! A checkpoint is only ever written after a merge fully succeeds; an
//! unreadable or missing checkpoint falls back to sending full history.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::doc::SyncDoc;
use crate::error::{SyncError, SyncResult};
use crate::storage::CheckpointStore;
use crate::types::DeviceId;

/// A computed change payload together with its change-unit count
#[derive(Debug, Clone)]
pub struct Delta {
    /// Encoded change set, ready for transport
    pub payload: Vec<u8>,
    /// Number of change units the payload carries
    pub change_count: usize,
}

impl Delta {
    /// Whether the delta carries no changes
    pub fn is_empty(&self) -> bool {
        self.change_count == 0
    }

    /// The payload as an option, `None` when empty
    ///
    /// An absent payload on the wire means an empty delta.
    pub fn payload_opt(&self) -> Option<&[u8]> {
        if self.payload.is_empty() {
            None
        } else {
            Some(&self.payload)
        }
    }
}

/// Computes and applies deltas against the replicated document
pub struct ChangeLog {
    checkpoints: Arc<dyn CheckpointStore>,
}

impl ChangeLog {
    /// Create a ChangeLog over the given checkpoint store
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { checkpoints }
    }

    /// Compute the changes `peer` has not yet seen
    ///
    /// Without a checkpoint for the peer this is the full document history.
    /// An unreadable checkpoint also degrades to full history; that wastes
    /// bandwidth but never correctness.
    pub fn compute_delta(&self, doc: &mut SyncDoc, peer: &DeviceId) -> SyncResult<Delta> {
        let heads = match self.checkpoints.load(peer) {
            Ok(Some(snapshot)) => match SyncDoc::load(&snapshot) {
                Ok(mut seen) => Some(seen.heads()),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Unreadable checkpoint, sending full history");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Checkpoint load failed, sending full history");
                None
            }
        };

        let heads = heads.unwrap_or_default();
        let payload = doc.changes_since(&heads);
        let change_count = doc.change_count_since(&heads);
        debug!(peer = %peer, changes = change_count, bytes = payload.len(), "Computed delta");
        Ok(Delta {
            payload,
            change_count,
        })
    }

    /// Apply an inbound change payload to the document
    ///
    /// Empty payloads are a no-op. Repeated application of the same payload
    /// is a no-op, and payload order never matters.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MalformedChangePayload` if the payload cannot be
    /// decoded as a valid change set; the document is left untouched.
    pub fn apply_delta(&self, doc: &mut SyncDoc, payload: &[u8]) -> SyncResult<usize> {
        let applied = doc.apply_changes(payload)?;
        debug!(changes = applied, bytes = payload.len(), "Applied delta");
        Ok(applied)
    }

    /// Persist the current document as the peer's checkpoint
    ///
    /// Callers treat failure as non-fatal: an outdated checkpoint only makes
    /// the next delta larger.
    pub fn save_checkpoint(&self, doc: &mut SyncDoc, peer: &DeviceId) -> SyncResult<()> {
        let snapshot = doc.save();
        self.checkpoints
            .save(peer, &snapshot)
            .map_err(|e| SyncError::CheckpointPersist(e.to_string()))?;
        debug!(peer = %peer, bytes = snapshot.len(), "Saved checkpoint");
        Ok(())
    }

    /// Advance the peer's checkpoint by exactly what crossed the wire
    ///
    /// The new checkpoint is the prior checkpoint plus the delta we sent and
    /// the delta we received — never a snapshot of the live document. A
    /// change that lands concurrently during an exchange was not sent, and
    /// checkpointing it would exclude it from every future delta for this
    /// peer.
    pub fn save_exchange_checkpoint(
        &self,
        peer: &DeviceId,
        sent: &[u8],
        received: &[u8],
    ) -> SyncResult<()> {
        let mut seen = match self.checkpoints.load(peer) {
            Ok(Some(snapshot)) => SyncDoc::load(&snapshot).unwrap_or_else(|e| {
                warn!(peer = %peer, error = %e, "Unreadable checkpoint, rebuilding from exchange");
                SyncDoc::new()
            }),
            _ => SyncDoc::new(),
        };
        seen.apply_changes(sent)
            .map_err(|e| SyncError::CheckpointPersist(e.to_string()))?;
        seen.apply_changes(received)
            .map_err(|e| SyncError::CheckpointPersist(e.to_string()))?;

        let snapshot = seen.save();
        self.checkpoints
            .save(peer, &snapshot)
            .map_err(|e| SyncError::CheckpointPersist(e.to_string()))?;
        debug!(peer = %peer, bytes = snapshot.len(), "Saved exchange checkpoint");
        Ok(())
    }
}
