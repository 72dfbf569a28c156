//! The `RedoWriter` collaborator contract (spec.md §4.2) plus two concrete
//! implementations: a local file-backed writer grounded on the teacher's
//! `DiskManager` (synchronous file handle behind a lock, atomic counters),
//! and a channel-backed writer standing in for a replicated transport.

use common::DurabilityMode;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write as IoWrite};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error, Clone)]
pub enum RedoError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("key exceeds maximum length")]
    KeyTooLarge,
    #[error("writer is an unmodifiable replica")]
    UnmodifiableReplica,
    #[error("writer is closed: {0}")]
    Closed(String),
}

/// Sink interface over the redo stream. `write` returns the commit
/// position the caller should wait on before reporting durability to the
/// application, or 0 when no durability wait is required.
pub trait RedoWriter: Send + Sync {
    /// May downgrade `mode` (e.g. a replica with no local disk might
    /// downgrade SYNC to NO_SYNC); never upgrades it.
    fn op_write_check(&self, mode: DurabilityMode) -> DurabilityMode;

    fn write(&self, buf: &[u8], commit_len: i64) -> Result<i64, RedoError>;

    /// `true` for writers whose stream format requires 4-byte record
    /// terminators (replicated); `false` for a local redo file.
    fn should_write_terminators(&self) -> bool;

    fn last_txn_id(&self) -> i64;

    fn set_last_txn_id(&self, id: i64);

    /// Exclusive writer latch, distinct from a context's own redo latch:
    /// the writer is shared across contexts, so reading `last_txn_id`,
    /// computing a delta against it, and writing the encoded record must
    /// happen as one atomic sequence from the writer's point of view.
    /// Callers acquire this while already holding their own redo latch
    /// (redo latch -> writer latch ordering).
    fn latch(&self) -> parking_lot::MutexGuard<'_, ()>;

    /// The latched first root cause of any write failure, consulted so the
    /// original error survives retries rather than being overwritten by a
    /// secondary failure.
    fn close_cause(&self) -> Option<RedoError>;

    fn close(&self, cause: RedoError);
}

struct LatchedCause {
    cause: Mutex<Option<RedoError>>,
}

impl LatchedCause {
    fn new() -> Self {
        Self {
            cause: Mutex::new(None),
        }
    }

    fn latch(&self, cause: RedoError) {
        let mut slot = self.cause.lock();
        if slot.is_none() {
            *slot = Some(cause);
        }
    }

    fn get(&self) -> Option<RedoError> {
        self.cause.lock().clone()
    }
}

/// A local, file-backed `RedoWriter`. No terminators: the local redo file
/// relies on contiguous delivery rather than record delimiters.
pub struct FileRedoWriter {
    file: Arc<RwLock<File>>,
    num_writes: AtomicU64,
    num_flushes: AtomicU64,
    last_txn_id: AtomicI64,
    cause: LatchedCause,
    latch: Mutex<()>,
}

impl FileRedoWriter {
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(RwLock::new(file)),
            num_writes: AtomicU64::new(0),
            num_flushes: AtomicU64::new(0),
            last_txn_id: AtomicI64::new(0),
            cause: LatchedCause::new(),
            latch: Mutex::new(()),
        }
    }

    pub fn num_writes(&self) -> u64 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn num_flushes(&self) -> u64 {
        self.num_flushes.load(Ordering::Relaxed)
    }
}

impl RedoWriter for FileRedoWriter {
    fn op_write_check(&self, mode: DurabilityMode) -> DurabilityMode {
        mode
    }

    #[instrument(skip(self, buf))]
    fn write(&self, buf: &[u8], commit_len: i64) -> Result<i64, RedoError> {
        if let Some(cause) = self.cause.get() {
            return Err(cause);
        }
        let mut file = self.file.write();
        file.seek(SeekFrom::End(0))
            .map_err(|e| self.fail(RedoError::Io(e.to_string())))?;
        file.write_all(buf)
            .map_err(|e| self.fail(RedoError::Io(e.to_string())))?;
        self.num_writes.fetch_add(1, Ordering::Relaxed);
        if commit_len >= 0 {
            file.sync_data()
                .map_err(|e| self.fail(RedoError::Io(e.to_string())))?;
            self.num_flushes.fetch_add(1, Ordering::Relaxed);
            let pos = file
                .stream_position()
                .map_err(|e| self.fail(RedoError::Io(e.to_string())))?;
            return Ok(pos as i64);
        }
        Ok(0)
    }

    fn should_write_terminators(&self) -> bool {
        false
    }

    fn last_txn_id(&self) -> i64 {
        self.last_txn_id.load(Ordering::Acquire)
    }

    fn set_last_txn_id(&self, id: i64) {
        self.last_txn_id.store(id, Ordering::Release);
    }

    fn latch(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.latch.lock()
    }

    fn close_cause(&self) -> Option<RedoError> {
        self.cause.get()
    }

    fn close(&self, cause: RedoError) {
        self.cause.latch(cause);
    }
}

impl FileRedoWriter {
    fn fail(&self, cause: RedoError) -> RedoError {
        self.cause.latch(cause.clone());
        cause
    }
}

/// A channel-backed stand-in for a replicated writer: each write is framed
/// with a terminator and handed to whatever decoder reads the other end of
/// `sender`. Used by the replication integration tests and the demo binary
/// in place of a real network transport.
pub struct ReplicatedRedoWriter {
    sender: SyncSender<Vec<u8>>,
    last_txn_id: AtomicI64,
    commit_counter: AtomicI64,
    cause: LatchedCause,
    latch: Mutex<()>,
}

impl ReplicatedRedoWriter {
    pub fn new(sender: SyncSender<Vec<u8>>) -> Self {
        Self {
            sender,
            last_txn_id: AtomicI64::new(0),
            commit_counter: AtomicI64::new(0),
            cause: LatchedCause::new(),
            latch: Mutex::new(()),
        }
    }
}

impl RedoWriter for ReplicatedRedoWriter {
    fn op_write_check(&self, mode: DurabilityMode) -> DurabilityMode {
        mode
    }

    #[instrument(skip(self, buf))]
    fn write(&self, buf: &[u8], commit_len: i64) -> Result<i64, RedoError> {
        if let Some(cause) = self.cause.get() {
            return Err(cause);
        }
        self.sender.send(buf.to_vec()).map_err(|e| {
            let cause = RedoError::Io(e.to_string());
            self.cause.latch(cause.clone());
            cause
        })?;
        if commit_len >= 0 {
            return Ok(self.commit_counter.fetch_add(1, Ordering::AcqRel) + 1);
        }
        Ok(0)
    }

    fn should_write_terminators(&self) -> bool {
        true
    }

    fn last_txn_id(&self) -> i64 {
        self.last_txn_id.load(Ordering::Acquire)
    }

    fn set_last_txn_id(&self, id: i64) {
        self.last_txn_id.store(id, Ordering::Release);
    }

    fn latch(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.latch.lock()
    }

    fn close_cause(&self) -> Option<RedoError> {
        self.cause.get()
    }

    fn close(&self, cause: RedoError) {
        self.cause.latch(cause);
    }
}
