//! The undo log registry: an arena of per-transaction reverse-operation
//! histories, linked most-recently-registered-first so recovery and
//! checkpoint (`writeToMaster`, `deleteUndoLogs`) can traverse every
//! in-progress transaction's state.
//!
//! spec.md's Design Notes call for arena + index handles instead of raw
//! prev/next pointers in shared records; slots carry a generation counter so
//! a stale handle (one from before an `unregister`) is rejected rather than
//! aliasing a reused slot.

use common::{IndexId, TxnId};

const NIL: u32 = u32::MAX;

/// One entry in a transaction's undo log: enough to reverse a single
/// forward redo (store/delete) record during rollback.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    /// Reverses a delete: re-insert the key with its prior value.
    Reinsert {
        index: IndexId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Reverses a store: delete the key, or restore `old_value` if it
    /// previously existed.
    Unstore {
        index: IndexId,
        key: Vec<u8>,
        old_value: Option<Vec<u8>>,
    },
    /// Reverses an application-defined custom redo operation.
    Custom { payload: Vec<u8> },
}

/// A transaction-private, ordered sequence of reverse-operation entries.
#[derive(Debug)]
pub struct UndoLog {
    txn: TxnId,
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new(txn: TxnId) -> Self {
        Self {
            txn,
            entries: Vec::new(),
        }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn push(&mut self, entry: UndoEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[UndoEntry] {
        &self.entries
    }

    /// Consumes the entries in rollback order (reverse of recording order).
    pub fn into_rollback_entries(mut self) -> Vec<UndoEntry> {
        self.entries.reverse();
        self.entries
    }
}

/// Stable handle into an `UndoLogRegistry`. Carries the slot's generation so
/// a handle outlived by `unregister` is detected rather than silently
/// aliasing whatever log was registered into the reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    value: Option<UndoLog>,
    generation: u32,
    prev: u32,
    next: u32,
}

/// The registry itself is not internally synchronized: spec.md requires
/// register/unregister and checkpoint traversal to be mutually exclusive
/// under the owning `TransactionContext`'s context monitor, so the monitor
/// is the caller's responsibility, not this type's.
#[derive(Default)]
pub struct UndoLogRegistry {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Index of the most-recently-registered log, or `NIL`.
    head: u32,
}

impl UndoLogRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            head: NIL,
        }
    }

    /// Links `log` at the head of the registry (most-recently-registered
    /// first) and returns a stable handle.
    pub fn register(&mut self, log: UndoLog) -> UndoHandle {
        let old_head = self.head;
        let idx = if let Some(i) = self.free_list.pop() {
            let slot = &mut self.slots[i as usize];
            slot.value = Some(log);
            slot.prev = NIL;
            slot.next = old_head;
            i
        } else {
            self.slots.push(Slot {
                value: Some(log),
                generation: 0,
                prev: NIL,
                next: old_head,
            });
            (self.slots.len() - 1) as u32
        };
        if old_head != NIL {
            self.slots[old_head as usize].prev = idx;
        }
        self.head = idx;
        UndoHandle {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    /// Splices `handle` out of the list and returns its log, or `None` if
    /// the handle is stale (already unregistered).
    pub fn unregister(&mut self, handle: UndoHandle) -> Option<UndoLog> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        let (prev, next) = (slot.prev, slot.next);
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);

        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }
        self.free_list.push(handle.index);
        value
    }

    pub fn get_mut(&mut self, handle: UndoHandle) -> Option<&mut UndoLog> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn has_logs(&self) -> bool {
        self.head != NIL
    }

    /// Traverses from most-recently-registered to oldest.
    pub fn iter(&self) -> UndoLogIter<'_> {
        UndoLogIter {
            registry: self,
            cur: self.head,
        }
    }
}

pub struct UndoLogIter<'a> {
    registry: &'a UndoLogRegistry,
    cur: u32,
}

impl<'a> Iterator for UndoLogIter<'a> {
    type Item = &'a UndoLog;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let slot = &self.registry.slots[self.cur as usize];
        self.cur = slot.next;
        slot.value.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_most_recent_first() {
        let mut registry = UndoLogRegistry::new();
        let h1 = registry.register(UndoLog::new(TxnId::from(1)));
        let _h2 = registry.register(UndoLog::new(TxnId::from(2)));
        let h3 = registry.register(UndoLog::new(TxnId::from(3)));

        let order: Vec<i64> = registry.iter().map(|l| l.txn().get()).collect();
        assert_eq!(order, vec![3, 2, 1]);

        registry.unregister(h3);
        registry.unregister(h1);
        let order: Vec<i64> = registry.iter().map(|l| l.txn().get()).collect();
        assert_eq!(order, vec![2]);
    }

    #[test]
    fn stale_handle_after_unregister_is_rejected() {
        let mut registry = UndoLogRegistry::new();
        let h1 = registry.register(UndoLog::new(TxnId::from(1)));
        registry.unregister(h1);
        assert!(registry.unregister(h1).is_none());
        assert!(registry.get_mut(h1).is_none());
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut registry = UndoLogRegistry::new();
        let h1 = registry.register(UndoLog::new(TxnId::from(1)));
        registry.unregister(h1);
        let h2 = registry.register(UndoLog::new(TxnId::from(2)));
        // Same arena slot is very likely reused; the stale handle must not
        // resolve to the new log.
        assert!(registry.get_mut(h1).is_none());
        assert!(registry.get_mut(h2).is_some());
    }

    #[test]
    fn empty_registry_has_no_logs() {
        let registry = UndoLogRegistry::new();
        assert!(!registry.has_logs());
        assert_eq!(registry.iter().count(), 0);
    }
}
