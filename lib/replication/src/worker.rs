//! `WorkerGroup`: a fixed-size pool of threads, each with a bounded task
//! queue, plus a transaction-affinity map so operations on the same
//! transaction always land on the same worker (spec.md §4.4).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use tracing::{error, instrument};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A stable handle identifying a worker in the pool, used as the affinity
/// anchor stored in a `TxnEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle(pub usize);

struct Worker {
    sender: Option<SyncSender<Task>>,
    handle: Option<JoinHandle<()>>,
}

/// Uncaught panics in a task are forwarded here; the callback is expected
/// to panic the owning database (spec.md §4.4, §7).
pub type FailHook = Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>;

pub struct WorkerGroup {
    workers: Vec<Worker>,
    affinity: Mutex<HashMap<i64, WorkerHandle>>,
    next_round_robin: Mutex<usize>,
}

impl WorkerGroup {
    pub fn new(size: usize, queue_depth: usize, fail: FailHook) -> Self {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx): (SyncSender<Task>, Receiver<Task>) = sync_channel(queue_depth);
            let fail = fail.clone();
            let handle = std::thread::spawn(move || {
                for task in rx {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
                    if let Err(cause) = result {
                        error!("worker task panicked");
                        fail(cause);
                    }
                }
            });
            workers.push(Worker {
                sender: Some(tx),
                handle: Some(handle),
            });
        }
        Self {
            workers,
            affinity: Mutex::new(HashMap::new()),
            next_round_robin: Mutex::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Resolves the worker bound to `txn_id` (stable once set), or picks a
    /// least-loaded worker round-robin for non-transactional work and
    /// remembers the binding if `txn_id` is non-zero.
    #[instrument(skip(self, task))]
    pub fn enqueue(&self, txn_id: i64, task: Task) -> WorkerHandle {
        if txn_id != 0 {
            let mut affinity = self.affinity.lock();
            let handle = *affinity
                .entry(txn_id)
                .or_insert_with(|| self.pick_round_robin());
            if let Some(sender) = &self.workers[handle.0].sender {
                sender.send(task).ok();
            }
            return handle;
        }
        let handle = self.pick_round_robin();
        if let Some(sender) = &self.workers[handle.0].sender {
            sender.send(task).ok();
        }
        handle
    }

    fn pick_round_robin(&self) -> WorkerHandle {
        let mut next = self.next_round_robin.lock();
        let idx = *next % self.workers.len();
        *next = (*next + 1) % self.workers.len();
        WorkerHandle(idx)
    }

    /// Releases the affinity binding for a finished transaction so its slot
    /// can be reused.
    pub fn forget(&self, txn_id: i64) {
        self.affinity.lock().remove(&txn_id);
    }

    /// Blocks until every task enqueued so far has completed, by sending a
    /// barrier-signalling task to every worker and waiting on all of them.
    #[instrument(skip(self))]
    pub fn join(&self) {
        let barrier = Arc::new(Barrier::new(self.workers.len() + 1));
        for worker in &self.workers {
            if let Some(sender) = &worker.sender {
                let barrier = barrier.clone();
                let _ = sender.send(Box::new(move || {
                    barrier.wait();
                }));
            }
        }
        barrier.wait();
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Dropping the owned sender (not a reference to it) closes the
            // channel, which ends the worker's `for task in rx` loop so the
            // join below doesn't block forever.
            worker.sender.take();
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_fail() -> FailHook {
        Arc::new(|_| {})
    }

    #[test]
    fn same_transaction_always_lands_on_the_same_worker() {
        let group = WorkerGroup::new(4, 16, noop_fail());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let seen = seen.clone();
            let handle = group.enqueue(42, Box::new(move || {
                seen.lock().push(());
            }));
            assert_eq!(handle, WorkerHandle(group.affinity.lock()[&42].0));
        }
        group.join();
        assert_eq!(seen.lock().len(), 8);
    }

    #[test]
    fn join_waits_for_all_enqueued_work() {
        let group = WorkerGroup::new(2, 16, noop_fail());
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let counter = counter.clone();
            group.enqueue(i, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        group.join();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
