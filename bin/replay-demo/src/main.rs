//! Demonstrates the redo/replay pipeline end to end: a `TransactionContext`
//! writes a small transaction through a `ReplicatedRedoWriter`, and a
//! `ReplRedoEngine` on the other end of the channel replays it into a fresh
//! `Database`.

use anyhow::Result;
use clap::Parser;
use common::{IndexId, TxnId};
use redo::{ReplicatedRedoWriter, TransactionContext};
use replication::{
    DecodedRecord, ReplRedoDecoder, ReplRedoEngine, ReplicationController, ReplicationManager,
    TransactionHandler,
};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use storage::{Database, LocalDatabase};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Writes a sample transaction through a redo writer and replays it")]
struct Args {
    /// Key to store.
    #[arg(long, default_value = "greeting")]
    key: String,

    /// Value to store.
    #[arg(long, default_value = "hello from the redo log")]
    value: String,

    /// Index identifier to store into.
    #[arg(long, default_value_t = 1)]
    index: u64,
}

struct LoggingReplicationManager;

impl ReplicationManager for LoggingReplicationManager {
    fn read_position(&self) -> i64 {
        0
    }
    fn notify_store(&self, index: IndexId, key: &[u8], value: &[u8]) {
        info!(%index, key = %String::from_utf8_lossy(key), value = %String::from_utf8_lossy(value), "replayed store");
    }
    fn notify_delete(&self, index: IndexId, key: &[u8]) {
        info!(%index, key = %String::from_utf8_lossy(key), "replayed delete");
    }
    fn notify_rename(&self, index: IndexId, new_name: &[u8]) {
        info!(%index, new_name = %String::from_utf8_lossy(new_name), "replayed rename");
    }
    fn notify_drop(&self, index: IndexId) {
        info!(%index, "replayed index drop");
    }
}

struct NoopHandler;

impl TransactionHandler for NoopHandler {
    fn redo(&self, _txn: TxnId, _payload: &[u8]) {}
    fn redo_locked(&self, _txn: TxnId, _index: IndexId, _key: &[u8], _payload: &[u8]) {}
}

struct LoggingReplicationController;

impl ReplicationController for LoggingReplicationController {
    fn leader_notify(&self) {
        info!("promoted to leader after replay stream reached a terminal state");
    }
}

fn main() -> Result<()> {
    common::util::trace::initialize_tracing()?;
    let args = Args::parse();

    let (tx, rx) = sync_channel::<Vec<u8>>(64);
    let context = TransactionContext::new(0, 1, 64 * 1024);
    context.bind_writer(Arc::new(ReplicatedRedoWriter::new(tx)))?;

    let txn = TxnId::from(context.next_transaction_id());
    context.redo_enter(txn)?;
    context.redo_store_commit_final(txn, IndexId::new(args.index), args.key.as_bytes(), args.value.as_bytes())?;
    info!(%txn, "wrote transaction to redo stream");

    let db = Arc::new(Database::new());
    let engine = ReplRedoEngine::new(
        db.clone(),
        2,
        64,
        Arc::new(LoggingReplicationManager),
        Arc::new(NoopHandler),
        Arc::new(LoggingReplicationController),
        Arc::new(|cause| {
            tracing::error!(?cause, "replay worker panicked");
        }),
    );
    engine.start_receiving();

    let mut buf = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        buf.extend_from_slice(&chunk);
    }
    let mut decoder = ReplRedoDecoder::new(&buf, true);
    while let Some(record) = decoder.next()? {
        let done = matches!(record, DecodedRecord::EndFile | DecodedRecord::Shutdown | DecodedRecord::Close);
        engine.dispatch(record)?;
        if done {
            break;
        }
    }
    engine.join();

    // `Database` is the durable owner of its indexes, so this finds the
    // same index the replay worker stored into.
    let idx = db.open_index(IndexId::new(args.index), &args.key);
    match idx.load(args.key.as_bytes())? {
        Some(value) => println!("replayed value: {}", String::from_utf8_lossy(&value)),
        None => println!("nothing replayed for key {:?}", args.key),
    }

    Ok(())
}
