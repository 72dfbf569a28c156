//! The byte-oriented `Index`: a single named collection of key/value pairs
//! that the redo/replication layer replays operations against. Index
//! contents are opaque bytes; structured tuple/schema encoding is out of
//! scope here (that concern belongs to a layer above this one).

use common::IndexId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index {0} is closed")]
    Closed(IndexId),
}

/// An index open for store/delete operations. `MemoryIndex` is the only
/// implementation here; a disk-backed B-tree is out of scope.
pub trait Index: Send + Sync {
    fn id(&self) -> IndexId;

    fn name(&self) -> &str;

    /// Stores `value` under `key`, returning the previous value if any.
    fn store(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, IndexError>;

    /// Removes `key`, returning the value that was present, if any.
    fn delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError>;

    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError>;

    fn is_closed(&self) -> bool;

    /// Marks the index closed. Operations against a closed index return
    /// `IndexError::Closed`, which callers may treat as recoverable by
    /// reopening rather than as a fatal database error.
    fn close(&self);
}

/// An in-memory `Index`. Backed by a `DashMap` rather than a sharded page
/// cache and B-tree: the redo/replay subsystem only needs key/value
/// semantics, not page layout.
pub struct MemoryIndex {
    id: IndexId,
    name: String,
    entries: DashMap<Vec<u8>, Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryIndex {
    pub fn new(id: IndexId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Index for MemoryIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        if self.is_closed() {
            return Err(IndexError::Closed(self.id));
        }
        Ok(self.entries.insert(key.to_vec(), value.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        if self.is_closed() {
            return Err(IndexError::Closed(self.id));
        }
        Ok(self.entries.remove(key).map(|(_, v)| v))
    }

    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        if self.is_closed() {
            return Err(IndexError::Closed(self.id));
        }
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_round_trips() {
        let idx = MemoryIndex::new(IndexId::new(1), "t");
        idx.store(b"k", b"v").unwrap();
        assert_eq!(idx.load(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn delete_returns_prior_value() {
        let idx = MemoryIndex::new(IndexId::new(1), "t");
        idx.store(b"k", b"v").unwrap();
        assert_eq!(idx.delete(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(idx.load(b"k").unwrap(), None);
    }

    #[test]
    fn closed_index_rejects_operations() {
        let idx = MemoryIndex::new(IndexId::new(1), "t");
        idx.close();
        assert!(matches!(idx.store(b"k", b"v"), Err(IndexError::Closed(_))));
    }
}
