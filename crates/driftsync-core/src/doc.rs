//! Automerge document wrapper for the replicated dataset
//!
//! `SyncDoc` wraps an Automerge document and exposes exactly the surface the
//! sync core needs: snapshot save/load, head tracking, delta extraction, and
//! delta application. Merge conflict resolution is entirely Automerge's
//! concern; this crate never inspects change contents.

use automerge::{transaction::Transactable, AutoCommit, ChangeHash, ReadDoc, ROOT};

use crate::error::{SyncError, SyncResult};

/// Replicated document synchronized between devices
///
/// Changes are causally ordered by Automerge and merging is commutative,
/// associative, and idempotent, so deltas can be applied in any order and
/// reapplied safely.
pub struct SyncDoc {
    doc: AutoCommit,
}

impl SyncDoc {
    /// Create a new empty document
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Load a document from a saved snapshot
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if the bytes are not a valid
    /// Automerge document.
    pub fn load(data: &[u8]) -> SyncResult<Self> {
        let doc = AutoCommit::load(data).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(Self { doc })
    }

    /// Save the full document state as a snapshot
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Fork the document for independent editing
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
        }
    }

    /// Merge another document into this one
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if the merge fails.
    pub fn merge(&mut self, other: &mut SyncDoc) -> SyncResult<()> {
        self.doc
            .merge(&mut other.doc)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(())
    }

    /// Get the current heads of the document DAG
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Extract all changes not covered by the given heads
    ///
    /// With empty heads this yields the full history. The returned bytes are
    /// empty when the document holds nothing beyond `heads`.
    pub fn changes_since(&mut self, heads: &[ChangeHash]) -> Vec<u8> {
        self.doc.save_after(heads)
    }

    /// Count the change units not covered by the given heads
    pub fn change_count_since(&mut self, heads: &[ChangeHash]) -> usize {
        self.doc.get_changes(heads).len()
    }

    /// Apply a change payload produced by [`SyncDoc::changes_since`]
    ///
    /// An empty payload is a no-op. Applying the same payload twice is also a
    /// no-op, and payloads commute, so arrival order never matters.
    ///
    /// Returns the number of change units that were new to this document.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MalformedChangePayload` if the bytes cannot be
    /// decoded as a valid change set. The document is left untouched.
    pub fn apply_changes(&mut self, data: &[u8]) -> SyncResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let before = self.doc.get_heads();
        self.doc
            .load_incremental(data)
            .map_err(|e| SyncError::MalformedChangePayload(e.to_string()))?;
        Ok(self.doc.get_changes(&before).len())
    }

    /// Put a string value at the document root
    ///
    /// Minimal mutation surface so merges can be exercised without any
    /// domain schema.
    pub fn set_value(&mut self, key: &str, value: &str) -> SyncResult<()> {
        self.doc
            .put(ROOT, key, value)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(())
    }

    /// Read a string value from the document root
    pub fn get_value(&self, key: &str) -> SyncResult<Option<String>> {
        let entry = self
            .doc
            .get(ROOT, key)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(entry
            .and_then(|(value, _)| value.to_str().map(|s| s.to_string())))
    }
}

impl Default for SyncDoc {
    fn default() -> Self {
        Self::new()
    }
}
