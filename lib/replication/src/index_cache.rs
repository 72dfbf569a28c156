//! The replay engine's index cache: `IndexId -> Weak<dyn Index>`, holding
//! indexes alive long enough to avoid reopening on every record without
//! pinning memory for inactive ones (spec.md §4.3 "Index cache").

use common::IndexId;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use storage::{Index, LocalDatabase};

pub struct IndexCache {
    entries: DashMap<IndexId, Weak<dyn Index>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the cached index if its weak reference is still live;
    /// otherwise reopens it through `db`, replaces the entry, and
    /// opportunistically sweeps other cleared entries.
    pub fn get_or_open(&self, db: &dyn LocalDatabase, id: IndexId, name: &str) -> Arc<dyn Index> {
        if let Some(weak) = self.entries.get(&id) {
            if let Some(strong) = weak.upgrade() {
                return strong;
            }
        }
        let index = db.open_index(id, name);
        self.entries.insert(id, Arc::downgrade(&index));
        self.sweep();
        index
    }

    fn sweep(&self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IndexCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::Database;

    #[test]
    fn reopening_after_the_cache_entry_clears_preserves_data() {
        let db = Database::new();
        let cache = IndexCache::new();
        {
            let idx = cache.get_or_open(&db, IndexId::new(1), "t");
            idx.store(b"k", b"v").unwrap();
        }
        // The cache's own weak entry is now stale, so this misses and goes
        // back through `db` — which is the durable owner and hands back the
        // same populated index rather than fabricating an empty one.
        let reopened = cache.get_or_open(&db, IndexId::new(1), "t");
        assert_eq!(reopened.load(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn live_reference_is_reused_not_reopened() {
        let db = Database::new();
        let cache = IndexCache::new();
        let first = cache.get_or_open(&db, IndexId::new(1), "t");
        let second = cache.get_or_open(&db, IndexId::new(1), "t");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
