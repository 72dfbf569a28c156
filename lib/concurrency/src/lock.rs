//! A narrow local lock manager. Deadlock detection and lock-wait graphs are
//! explicitly out of scope (spec.md §1 Non-goals): callers are expected to
//! acquire locks in the order the redo stream already imposes, the same way
//! `ReplRedoEngine` acquires locks synchronously on the decoder thread
//! before ever enqueuing work.

use common::{IndexId, TxnId};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;

/// Only `Unsafe` and `UpgradableRead` matter to the redo/replay core (spec.md
/// §3); the remaining variants are preserved for `LocalTransaction::lock_mode`
/// so callers outside the core can still express their isolation intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Unsafe,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    UpgradableRead,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::UpgradableRead
    }
}

#[derive(Default)]
struct KeyLockState {
    shared_holders: HashSet<TxnId>,
    upgradable_holder: Option<TxnId>,
    exclusive_holder: Option<TxnId>,
}

struct KeyLock {
    state: Mutex<KeyLockState>,
    released: Condvar,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(KeyLockState::default()),
            released: Condvar::new(),
        }
    }
}

/// A local (non-distributed) lock manager keyed by `(IndexId, key)`.
pub struct LocalLockManager {
    table: DashMap<(IndexId, Vec<u8>), Arc<KeyLock>>,
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    fn entry(&self, index: IndexId, key: &[u8]) -> Arc<KeyLock> {
        self.table
            .entry((index, key.to_vec()))
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone()
    }

    /// Blocks (with no timeout) until `txn` holds a shared lock on `key`.
    pub fn lock_shared(&self, index: IndexId, key: &[u8], txn: TxnId) {
        let lock = self.entry(index, key);
        let mut state = lock.state.lock();
        loop {
            let blocked = state.exclusive_holder.is_some() && state.exclusive_holder != Some(txn);
            if !blocked {
                state.shared_holders.insert(txn);
                return;
            }
            lock.released.wait(&mut state);
        }
    }

    /// Blocks until `txn` holds the (single-writer) upgradable lock.
    pub fn lock_upgradable(&self, index: IndexId, key: &[u8], txn: TxnId) {
        let lock = self.entry(index, key);
        let mut state = lock.state.lock();
        loop {
            let blocked_by_upgradable =
                state.upgradable_holder.is_some() && state.upgradable_holder != Some(txn);
            let blocked_by_exclusive =
                state.exclusive_holder.is_some() && state.exclusive_holder != Some(txn);
            if !blocked_by_upgradable && !blocked_by_exclusive {
                state.upgradable_holder = Some(txn);
                return;
            }
            lock.released.wait(&mut state);
        }
    }

    /// Blocks until `txn` holds the exclusive lock (typically promoted from
    /// an upgradable lock already held by the same transaction).
    pub fn lock_exclusive(&self, index: IndexId, key: &[u8], txn: TxnId) {
        let lock = self.entry(index, key);
        let mut state = lock.state.lock();
        loop {
            let other_shared = state.shared_holders.iter().any(|&h| h != txn);
            let other_exclusive =
                state.exclusive_holder.is_some() && state.exclusive_holder != Some(txn);
            if !other_shared && !other_exclusive {
                state.exclusive_holder = Some(txn);
                return;
            }
            lock.released.wait(&mut state);
        }
    }

    /// Releases every lock mode `txn` holds on `index`/`key`.
    pub fn unlock(&self, index: IndexId, key: &[u8], txn: TxnId) {
        let Some(entry) = self.table.get(&(index, key.to_vec())) else {
            return;
        };
        let lock = entry.clone();
        drop(entry);
        let mut state = lock.state.lock();
        state.shared_holders.remove(&txn);
        if state.upgradable_holder == Some(txn) {
            state.upgradable_holder = None;
        }
        if state.exclusive_holder == Some(txn) {
            state.exclusive_holder = None;
        }
        lock.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_excludes_other_shared() {
        let mgr = LocalLockManager::new();
        let idx = IndexId::new(1);
        mgr.lock_exclusive(idx, b"k", TxnId::from(1));
        // Same txn can still acquire shared on its own exclusive key.
        mgr.lock_shared(idx, b"k", TxnId::from(1));
        mgr.unlock(idx, b"k", TxnId::from(1));
    }

    #[test]
    fn upgradable_then_exclusive_same_txn() {
        let mgr = LocalLockManager::new();
        let idx = IndexId::new(1);
        let txn = TxnId::from(5);
        mgr.lock_upgradable(idx, b"k", txn);
        mgr.lock_exclusive(idx, b"k", txn);
        mgr.unlock(idx, b"k", txn);
    }
}
