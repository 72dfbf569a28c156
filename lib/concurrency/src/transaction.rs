//! `LocalTransaction` and its default implementation, `Transaction`: the
//! collaborator the redo/replication crates drive through commit, rollback
//! and lock acquisition.

use crate::lock::{LocalLockManager, LockMode};
use crate::undo::{UndoEntry, UndoHandle, UndoLog, UndoLogRegistry};
use common::{DurabilityMode, IndexId, TxnId};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// The operations `ReplRedoEngine` and application code need from a
/// transaction, independent of how locking and undo are actually
/// implemented. `redo::TransactionContext` is generic over this trait so
/// tests can swap in a fake.
pub trait LocalTransaction: Send + Sync {
    fn id(&self) -> TxnId;

    /// Called when a thread begins operating on behalf of this transaction
    /// (e.g. a `WorkerGroup` thread picking up queued work).
    fn enter(&self);

    /// Called when the thread is done, before the transaction may migrate
    /// to another thread.
    fn exit(&self);

    fn commit(&self) -> Result<(), TransactionError>;

    /// Commits this transaction and every transaction nested beneath it.
    fn commit_all(&self) -> Result<(), TransactionError>;

    fn rollback(&self) -> Result<(), TransactionError>;

    /// Clears transaction state for reuse (pooled transactions).
    fn reset(&self);

    fn lock_shared(&self, index: IndexId, key: &[u8]);
    fn lock_upgradable(&self, index: IndexId, key: &[u8]);
    fn lock_exclusive(&self, index: IndexId, key: &[u8]);

    /// Invoked during recovery for a transaction left in-flight by a crash.
    /// Returns `true` if the transaction should be rolled back.
    fn recovery_cleanup(&self, rollback: bool) -> bool;

    fn attach(&self, tag: Option<String>);
    fn attachment(&self) -> Option<String>;

    fn durability_mode(&self) -> DurabilityMode;
    fn set_durability_mode(&self, mode: DurabilityMode);

    fn lock_mode(&self) -> LockMode;
}

#[derive(Debug, Error, Clone)]
pub enum TransactionError {
    #[error("transaction {0} already committed or rolled back")]
    AlreadyFinished(TxnId),
}

struct TransactionState {
    durability: DurabilityMode,
    lock_mode: LockMode,
    attachment: Option<String>,
    undo_handle: Option<UndoHandle>,
    finished: bool,
}

/// Default `LocalTransaction` implementation: an id, a durability mode, an
/// undo log registered lazily on first write, and delegated locking through
/// a shared `LocalLockManager`.
pub struct Transaction {
    id: TxnId,
    locks: Arc<LocalLockManager>,
    undo: Arc<Mutex<UndoLogRegistry>>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub fn new(id: TxnId, locks: Arc<LocalLockManager>, undo: Arc<Mutex<UndoLogRegistry>>) -> Self {
        Self {
            id,
            locks,
            undo,
            state: Mutex::new(TransactionState {
                durability: DurabilityMode::default(),
                lock_mode: LockMode::default(),
                attachment: None,
                undo_handle: None,
                finished: false,
            }),
        }
    }

    /// Appends `entry` to this transaction's undo log, registering one
    /// lazily if this is the first modification.
    pub fn push_undo(&self, entry: UndoEntry) {
        let mut state = self.state.lock();
        let mut registry = self.undo.lock();
        let handle = *state
            .undo_handle
            .get_or_insert_with(|| registry.register(UndoLog::new(self.id)));
        if let Some(log) = registry.get_mut(handle) {
            log.push(entry);
        }
    }

    fn finish(&self, rollback: bool) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(TransactionError::AlreadyFinished(self.id));
        }
        if let Some(handle) = state.undo_handle.take() {
            let mut registry = self.undo.lock();
            if let Some(log) = registry.unregister(handle) {
                if rollback {
                    // Applying a rollback entry is the owning Database's
                    // responsibility; the undo log only records what must
                    // happen, not how.
                    for entry in log.into_rollback_entries() {
                        drop(entry);
                    }
                }
            }
        }
        state.finished = true;
        Ok(())
    }
}

impl LocalTransaction for Transaction {
    fn id(&self) -> TxnId {
        self.id
    }

    fn enter(&self) {}

    fn exit(&self) {}

    #[instrument(skip(self), fields(txn = %self.id))]
    fn commit(&self) -> Result<(), TransactionError> {
        self.finish(false)
    }

    fn commit_all(&self) -> Result<(), TransactionError> {
        self.commit()
    }

    #[instrument(skip(self), fields(txn = %self.id))]
    fn rollback(&self) -> Result<(), TransactionError> {
        self.finish(true)
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.attachment = None;
        state.undo_handle = None;
        state.finished = false;
    }

    fn lock_shared(&self, index: IndexId, key: &[u8]) {
        self.locks.lock_shared(index, key, self.id);
    }

    fn lock_upgradable(&self, index: IndexId, key: &[u8]) {
        self.locks.lock_upgradable(index, key, self.id);
    }

    fn lock_exclusive(&self, index: IndexId, key: &[u8]) {
        self.locks.lock_exclusive(index, key, self.id);
    }

    fn recovery_cleanup(&self, rollback: bool) -> bool {
        rollback
    }

    fn attach(&self, tag: Option<String>) {
        self.state.lock().attachment = tag;
    }

    fn attachment(&self) -> Option<String> {
        self.state.lock().attachment.clone()
    }

    fn durability_mode(&self) -> DurabilityMode {
        self.state.lock().durability
    }

    fn set_durability_mode(&self, mode: DurabilityMode) {
        self.state.lock().durability = mode;
    }

    fn lock_mode(&self) -> LockMode {
        self.state.lock().lock_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: i64) -> Transaction {
        Transaction::new(
            TxnId::from(id),
            Arc::new(LocalLockManager::new()),
            Arc::new(Mutex::new(UndoLogRegistry::new())),
        )
    }

    #[test]
    fn commit_clears_undo_log() {
        let t = txn(1);
        t.push_undo(UndoEntry::Custom { payload: vec![1] });
        assert!(t.commit().is_ok());
        assert!(t.commit().is_err());
    }

    #[test]
    fn rollback_then_commit_fails() {
        let t = txn(2);
        t.push_undo(UndoEntry::Custom { payload: vec![1] });
        assert!(t.rollback().is_ok());
        assert!(t.commit().is_err());
    }

    #[test]
    fn attachment_round_trips() {
        let t = txn(3);
        t.attach(Some("worker-1".into()));
        assert_eq!(t.attachment(), Some("worker-1".into()));
    }

    #[test]
    fn durability_mode_round_trips() {
        let t = txn(4);
        t.set_durability_mode(DurabilityMode::NoSync);
        assert_eq!(t.durability_mode(), DurabilityMode::NoSync);
    }
}
