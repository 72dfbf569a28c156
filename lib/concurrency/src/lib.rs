pub mod lock;
pub mod transaction;
pub mod undo;

pub use lock::{LocalLockManager, LockMode};
pub use transaction::{LocalTransaction, Transaction, TransactionError};
pub use undo::{UndoEntry, UndoHandle, UndoLog, UndoLogRegistry};
