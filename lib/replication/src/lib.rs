pub mod decoder;
pub mod engine;
pub mod error;
pub mod index_cache;
pub mod testing;
pub mod txn_table;
pub mod worker;

pub use decoder::{DecodeError, DecodedRecord, ReplRedoDecoder};
pub use engine::{EngineState, ReplRedoEngine, ReplicationController, ReplicationManager, TransactionHandler};
pub use error::ReplicationError;
pub use index_cache::IndexCache;
pub use testing::{NoopReplicationController, RecordedEvent, RecordingReplicationManager};
pub use txn_table::{TransactionTable, TxnEntry};
pub use worker::{FailHook, Task, WorkerGroup, WorkerHandle};
