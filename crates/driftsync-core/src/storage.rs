//! Keyed checkpoint persistence
//!
//! A checkpoint is the snapshot of the document as it was when a peer last
//! received our changes. Checkpoints only shrink future deltas; losing one
//! never loses data, so the store is allowed to fail soft.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};

use crate::error::SyncResult;
use crate::types::DeviceId;

const CHECKPOINTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Keyed persistence for per-peer document checkpoints
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot under the peer key, overwriting any prior value
    fn save(&self, peer: &DeviceId, snapshot: &[u8]) -> SyncResult<()>;

    /// Load the snapshot saved for a peer, if any
    fn load(&self, peer: &DeviceId) -> SyncResult<Option<Vec<u8>>>;

    /// Drop the snapshot for a peer
    fn remove(&self, peer: &DeviceId) -> SyncResult<()>;
}

/// Durable checkpoint store backed by redb
#[derive(Clone)]
pub struct RedbCheckpoints {
    db: Arc<RwLock<Database>>,
}

impl RedbCheckpoints {
    /// Open or create a checkpoint database at the given path
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CHECKPOINTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl CheckpointStore for RedbCheckpoints {
    fn save(&self, peer: &DeviceId, snapshot: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINTS_TABLE)?;
            table.insert(peer.as_str(), snapshot)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load(&self, peer: &DeviceId) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHECKPOINTS_TABLE)?;
        Ok(table.get(peer.as_str())?.map(|v| v.value().to_vec()))
    }

    fn remove(&self, peer: &DeviceId) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHECKPOINTS_TABLE)?;
            table.remove(peer.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory checkpoint store for tests and ephemeral devices
#[derive(Clone, Default)]
pub struct MemoryCheckpoints {
    map: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryCheckpoints {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpoints {
    fn save(&self, peer: &DeviceId, snapshot: &[u8]) -> SyncResult<()> {
        self.map
            .write()
            .insert(peer.as_str().to_string(), snapshot.to_vec());
        Ok(())
    }

    fn load(&self, peer: &DeviceId) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(peer.as_str()).cloned())
    }

    fn remove(&self, peer: &DeviceId) -> SyncResult<()> {
        self.map.write().remove(peer.as_str());
        Ok(())
    }
}
