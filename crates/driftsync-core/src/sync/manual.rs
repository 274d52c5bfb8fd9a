//! Manual transfer via displayed and scanned codes
//!
//! When no network path exists, a sync message is rendered as one or more
//! text frames, each small enough for a single visual code. The rendering of
//! frames to pixels is the embedder's concern; this module owns the framing.

use tracing::debug;

use crate::error::SyncResult;
use crate::sync::chunk::{self, ChunkAssembler, DEFAULT_CAPACITY};
use crate::sync::protocol::SyncMessage;

/// Result of feeding one scanned frame into a transfer
#[derive(Debug)]
pub enum ScanOutcome {
    /// The frame completed the transfer
    Complete(SyncMessage),
    /// More chunks are still outstanding
    Partial {
        /// Unique chunks received so far
        received: usize,
        /// Total chunks the bundle declares
        total: usize,
    },
}

/// Frames sync messages for code-based transfer
#[derive(Debug, Clone, Copy)]
pub struct ManualTransport {
    capacity: usize,
}

impl ManualTransport {
    /// Create a transport with a custom frame capacity
    ///
    /// The capacity bounds each frame's length in bytes. It is validated
    /// lazily: a capacity too small for a chunk header surfaces as
    /// `SyncError::CapacityTooSmall` from [`ManualTransport::encode_frames`].
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// The frame capacity in use
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Render a sync message as displayable frames
    ///
    /// A message that fits the capacity yields exactly one frame holding the
    /// bare message; larger messages are chunked.
    pub fn encode_frames(&self, message: &SyncMessage) -> SyncResult<Vec<String>> {
        let encoded = message.encode()?;
        // SyncMessage JSON is always valid UTF-8.
        let text = String::from_utf8_lossy(&encoded).into_owned();
        let frames = chunk::split(&text, self.capacity)?;
        debug!(frames = frames.len(), bytes = text.len(), "Encoded manual frames");
        Ok(frames)
    }

    /// Feed one scanned frame into a transfer
    ///
    /// Bare frames complete immediately. Chunked frames accumulate in the
    /// assembler until the bundle is whole, in any scan order; re-scans of a
    /// held chunk are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidChunk` for malformed or inconsistent
    /// chunks and `SyncError::InvalidMessage` when the assembled text is not
    /// a valid sync message. The assembler keeps its chunks either way.
    pub fn decode_frame(
        &self,
        frame: &str,
        assembler: &mut ChunkAssembler,
    ) -> SyncResult<ScanOutcome> {
        let Some(piece) = chunk::parse_header(frame)? else {
            return Ok(ScanOutcome::Complete(SyncMessage::decode(frame.as_bytes())?));
        };

        assembler.push(piece)?;
        if assembler.is_complete() {
            let text = assembler.assemble()?;
            debug!(chunks = assembler.received(), "Manual transfer complete");
            return Ok(ScanOutcome::Complete(SyncMessage::decode(text.as_bytes())?));
        }

        Ok(ScanOutcome::Partial {
            received: assembler.received(),
            total: assembler.total().unwrap_or(0),
        })
    }
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
