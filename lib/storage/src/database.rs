//! `LocalDatabase`: the collection of open indexes that the redo/replay
//! layer stores into and deletes from. `MemoryIndex` has no on-disk backing
//! of its own, so the database holds the sole durable `Arc` to each one;
//! the replication engine's own `IndexCache` layers a `Weak` cache on top of
//! this, reopening through here whenever its weak reference clears.

use crate::index::{Index, IndexError, MemoryIndex};
use common::IndexId;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("no index registered for id {0}")]
    UnknownIndex(IndexId),
}

/// Lifecycle events a `LocalDatabase` reports to listeners, mirroring the
/// original engine's `EventListener` hooks relevant to replay: index
/// creation/drop and checkpoint boundaries. Page-cache and compaction
/// events are out of scope.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    IndexOpened { index: IndexId },
    IndexClosed { index: IndexId },
    IndexDropped { index: IndexId },
    CheckpointStarted,
    CheckpointCompleted,
}

pub trait EventListener: Send + Sync {
    fn notify(&self, event: DatabaseEvent);
}

pub trait LocalDatabase: Send + Sync {
    fn open_index(&self, id: IndexId, name: &str) -> Arc<dyn Index>;

    fn find_index(&self, id: IndexId) -> Option<Arc<dyn Index>>;

    fn drop_index(&self, id: IndexId) -> Result<(), DatabaseError>;
}

/// The default `LocalDatabase`: an index cache keyed by `IndexId`, holding
/// the durable strong reference to each open index. Indexes are only
/// actually removed via `drop_index`.
pub struct Database {
    indexes: DashMap<IndexId, Arc<dyn Index>>,
    listener: Option<Arc<dyn EventListener>>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            indexes: DashMap::new(),
            listener: None,
        }
    }

    pub fn with_listener(listener: Arc<dyn EventListener>) -> Self {
        Self {
            indexes: DashMap::new(),
            listener: Some(listener),
        }
    }

    fn notify(&self, event: DatabaseEvent) {
        if let Some(listener) = &self.listener {
            listener.notify(event);
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDatabase for Database {
    #[instrument(skip(self))]
    fn open_index(&self, id: IndexId, name: &str) -> Arc<dyn Index> {
        if let Some(existing) = self.find_index(id) {
            return existing;
        }
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new(id, name));
        self.indexes.insert(id, index.clone());
        self.notify(DatabaseEvent::IndexOpened { index: id });
        index
    }

    fn find_index(&self, id: IndexId) -> Option<Arc<dyn Index>> {
        self.indexes.get(&id).map(|entry| entry.clone())
    }

    #[instrument(skip(self))]
    fn drop_index(&self, id: IndexId) -> Result<(), DatabaseError> {
        let index = self
            .find_index(id)
            .ok_or(DatabaseError::UnknownIndex(id))?;
        index.close();
        self.indexes.remove(&id);
        self.notify(DatabaseEvent::IndexDropped { index: id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_index_is_cached_by_id() {
        let db = Database::new();
        let a = db.open_index(IndexId::new(1), "t");
        let b = db.open_index(IndexId::new(1), "t");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn drop_index_closes_and_forgets_it() {
        let db = Database::new();
        let idx = db.open_index(IndexId::new(1), "t");
        db.drop_index(IndexId::new(1)).unwrap();
        assert!(idx.is_closed());
        assert!(db.find_index(IndexId::new(1)).is_none());
    }

    #[test]
    fn index_survives_once_every_external_strong_ref_is_dropped() {
        let db = Database::new();
        {
            let idx = db.open_index(IndexId::new(1), "t");
            idx.store(b"k", b"v").unwrap();
        }
        // The database itself is the durable owner; dropping a caller's
        // handle must not discard what was stored.
        let reopened = db.find_index(IndexId::new(1)).unwrap();
        assert_eq!(reopened.load(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
