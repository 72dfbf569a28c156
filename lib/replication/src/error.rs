use common::IndexId;
use thiserror::Error;

/// Error kinds on the replay path (spec.md §7). `ClosedIndex` is
/// recoverable by reopening; `UnmodifiableReplica` is a terminal, silent
/// signal; `Decode` means the stream itself is malformed; `Panic` wraps
/// whatever a worker task panicked with, forwarded to the database event
/// listener before the database closes.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("index {0} is closed")]
    ClosedIndex(IndexId),
    #[error("writer is an unmodifiable replica")]
    UnmodifiableReplica,
    #[error("malformed redo stream: {0}")]
    Decode(#[from] crate::decoder::DecodeError),
    #[error("replay task panicked")]
    Panic,
}
