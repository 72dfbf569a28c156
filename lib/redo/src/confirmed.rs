//! The per-context confirmed-position watermark: a `(commit-position,
//! TxnId)` pair updated only if the incoming position is strictly greater,
//! made linearizable by a single-word CAS sentinel lock rather than a
//! mutex (spec.md §3, §5).

use common::TxnId;
use std::sync::atomic::{AtomicI64, Ordering};

const LOCKED: i64 = -1;
const SPIN_BOUND: u32 = 64;

/// Holds `position` under the sentinel lock and `txn_id` in a plain atomic:
/// the writer publishes `txn_id` before releasing the position, so a
/// reader that observes an unlocked position always sees a `txn_id` that
/// is at least as new.
pub struct ConfirmedPosition {
    position: AtomicI64,
    txn_id: AtomicI64,
}

impl ConfirmedPosition {
    pub fn new() -> Self {
        Self {
            position: AtomicI64::new(0),
            txn_id: AtomicI64::new(TxnId::NONE.get()),
        }
    }

    /// Current `(position, txn_id)`. May briefly observe a position from
    /// before the matching `txn_id` write if called concurrently with an
    /// in-flight `confirmed`, but never a torn combination that wasn't
    /// published by some call.
    pub fn get(&self) -> (i64, TxnId) {
        loop {
            let pos = self.position.load(Ordering::Acquire);
            if pos != LOCKED {
                let txn = TxnId::from(self.txn_id.load(Ordering::Acquire));
                return (pos, txn);
            }
            std::thread::yield_now();
        }
    }

    /// Idempotent update-if-greater. Returns `true` if this call's value
    /// was installed.
    pub fn confirmed(&self, pos: i64, txn_id: TxnId) -> bool {
        let mut spins = 0u32;
        loop {
            let current = self.position.load(Ordering::Acquire);
            if current != LOCKED && current >= pos {
                return false;
            }
            if current == LOCKED {
                if spins < SPIN_BOUND {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                continue;
            }
            match self.position.compare_exchange(
                current,
                LOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.txn_id.store(txn_id.get(), Ordering::Release);
                    self.position.store(pos, Ordering::Release);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Combines another context's confirmed position into this one,
    /// keeping whichever pair has the greater position.
    pub fn higher_confirmed(&self, other: &ConfirmedPosition) {
        let (pos, txn) = other.get();
        self.confirmed(pos, txn);
    }

    pub fn copy_confirmed(&self, other: &ConfirmedPosition) {
        let (pos, txn) = other.get();
        self.position.store(pos, Ordering::Release);
        self.txn_id.store(txn.get(), Ordering::Release);
    }
}

impl Default for ConfirmedPosition {
    fn default() -> Self {
        Self::new()
    }
}
