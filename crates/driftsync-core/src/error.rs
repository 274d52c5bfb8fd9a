//! Error types for the driftsync core

use thiserror::Error;

/// Main error type for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Engine was used before `initialize` bound a document
    #[error("Sync engine not initialized")]
    NotInitialized,

    /// No transport can reach the peer (no address, no negotiation channel)
    #[error("No usable transport for peer: {0}")]
    TransportUnavailable(String),

    /// A sync cycle is already running for this peer
    #[error("Sync already in progress with peer: {0}")]
    SyncInProgress(String),

    /// Wire envelope could not be decoded or is missing required fields
    #[error("Invalid sync message: {0}")]
    InvalidMessage(String),

    /// Change payload could not be decoded as a valid change set
    #[error("Malformed change payload: {0}")]
    MalformedChangePayload(String),

    /// Chunk header is structurally invalid or inconsistent with its set
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// Fewer unique chunks than the set declares
    #[error("Missing chunks: received {received} of {total}")]
    MissingChunks {
        /// Unique chunk indices received so far
        received: usize,
        /// Total chunks the bundle declares
        total: usize,
    },

    /// Transfer capacity cannot fit a chunk header plus payload
    #[error("Transfer capacity {0} is too small for the chunk header")]
    CapacityTooSmall(usize),

    /// Peer channel negotiation failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Checkpoint persistence failed (non-fatal, degrades future delta size)
    #[error("Checkpoint persistence failed: {0}")]
    CheckpointPersist(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
