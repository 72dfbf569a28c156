//! The replay-side transaction table: an arena of `TxnEntry` slots indexed
//! by a scrambled `TxnId`, mirroring the undo log registry's arena +
//! generation-checked handles rather than keying a plain map by raw id
//! (spec.md §9 Design Notes). Accessed only by the decoder thread;
//! intentionally not concurrency-safe.

use crate::worker::WorkerHandle;
use common::TxnId;
use concurrency::LocalTransaction;
use std::collections::HashMap;
use std::sync::Arc;

/// Fibonacci-hashing multiplier (`2^64 * (sqrt(5) - 1) / 2`), used to
/// spread identifiers minted with a common stride across buckets.
const HASH_SPREAD: u64 = 0x9E3779B97F4A7C15;

fn scramble(txn_id: TxnId) -> u64 {
    (txn_id.get() as u64).wrapping_mul(HASH_SPREAD)
}

pub struct TxnEntry {
    pub txn: Arc<dyn LocalTransaction>,
    pub worker: Option<WorkerHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    value: Option<TxnEntry>,
    generation: u32,
}

#[derive(Default)]
pub struct TransactionTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    by_txn: HashMap<u64, SlotHandle>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            by_txn: HashMap::new(),
        }
    }

    fn resolve(&self, handle: SlotHandle) -> Option<&TxnEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    fn resolve_mut(&mut self, handle: SlotHandle) -> Option<&mut TxnEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn get(&self, txn_id: TxnId) -> Option<&TxnEntry> {
        let handle = *self.by_txn.get(&scramble(txn_id))?;
        self.resolve(handle)
    }

    pub fn get_mut(&mut self, txn_id: TxnId) -> Option<&mut TxnEntry> {
        let handle = *self.by_txn.get(&scramble(txn_id))?;
        self.resolve_mut(handle)
    }

    /// Resolves the entry for `txn_id`, creating one via `make` if this is
    /// the first time the decoder has seen it.
    pub fn entry_or_create(
        &mut self,
        txn_id: TxnId,
        make: impl FnOnce() -> Arc<dyn LocalTransaction>,
    ) -> &mut TxnEntry {
        let key = scramble(txn_id);
        if let Some(&handle) = self.by_txn.get(&key) {
            return self.slots[handle.index as usize]
                .value
                .as_mut()
                .expect("live handle always points at an occupied slot");
        }
        let entry = TxnEntry {
            txn: make(),
            worker: None,
        };
        let idx = if let Some(i) = self.free_list.pop() {
            self.slots[i as usize].value = Some(entry);
            i
        } else {
            self.slots.push(Slot {
                value: Some(entry),
                generation: 0,
            });
            (self.slots.len() - 1) as u32
        };
        let handle = SlotHandle {
            index: idx,
            generation: self.slots[idx as usize].generation,
        };
        self.by_txn.insert(key, handle);
        self.slots[idx as usize].value.as_mut().unwrap()
    }

    pub fn remove(&mut self, txn_id: TxnId) -> Option<TxnEntry> {
        let handle = self.by_txn.remove(&scramble(txn_id))?;
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        value
    }

    pub fn len(&self) -> usize {
        self.by_txn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_txn.is_empty()
    }

    /// Removes and returns every live entry, for use when the stream
    /// resets and every in-progress transaction must roll back.
    pub fn drain(&mut self) -> Vec<TxnEntry> {
        let handles: Vec<SlotHandle> = self.by_txn.drain().map(|(_, h)| h).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(slot) = self.slots.get_mut(handle.index as usize) {
                if slot.generation == handle.generation {
                    if let Some(value) = slot.value.take() {
                        slot.generation = slot.generation.wrapping_add(1);
                        self.free_list.push(handle.index);
                        out.push(value);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concurrency::{LocalLockManager, Transaction, UndoLogRegistry};
    use parking_lot::Mutex;

    fn make_txn(id: i64) -> Arc<dyn LocalTransaction> {
        Arc::new(Transaction::new(
            TxnId::from(id),
            Arc::new(LocalLockManager::new()),
            Arc::new(Mutex::new(UndoLogRegistry::new())),
        ))
    }

    #[test]
    fn entry_or_create_is_idempotent_per_txn_id() {
        let mut table = TransactionTable::new();
        let a = table.entry_or_create(TxnId::from(5), || make_txn(5)) as *const TxnEntry;
        let b = table.entry_or_create(TxnId::from(5), || make_txn(5)) as *const TxnEntry;
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_txn_ids_get_distinct_entries() {
        let mut table = TransactionTable::new();
        table.entry_or_create(TxnId::from(1), || make_txn(1));
        table.entry_or_create(TxnId::from(2), || make_txn(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_txn_id_is_gone_and_slot_is_reused_with_new_generation() {
        let mut table = TransactionTable::new();
        table.entry_or_create(TxnId::from(1), || make_txn(1));
        assert!(table.remove(TxnId::from(1)).is_some());
        assert!(table.get(TxnId::from(1)).is_none());

        table.entry_or_create(TxnId::from(2), || make_txn(2));
        assert_eq!(table.len(), 1);
        assert!(table.get(TxnId::from(2)).is_some());
    }

    #[test]
    fn drain_empties_the_table_and_returns_every_live_entry() {
        let mut table = TransactionTable::new();
        table.entry_or_create(TxnId::from(1), || make_txn(1));
        table.entry_or_create(TxnId::from(2), || make_txn(2));
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
