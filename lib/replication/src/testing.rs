//! A recording `ReplicationManager` used by integration tests in place of
//! a real network transport (explicitly out of scope per the core's
//! purpose and external-interfaces sections).

use crate::engine::{ReplicationController, ReplicationManager};
use common::IndexId;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Store { index: IndexId, key: Vec<u8>, value: Vec<u8> },
    Delete { index: IndexId, key: Vec<u8> },
    Rename { index: IndexId, new_name: Vec<u8> },
    Drop { index: IndexId },
}

#[derive(Default)]
pub struct RecordingReplicationManager {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingReplicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

impl ReplicationManager for RecordingReplicationManager {
    fn read_position(&self) -> i64 {
        0
    }

    fn notify_store(&self, index: IndexId, key: &[u8], value: &[u8]) {
        self.events.lock().push(RecordedEvent::Store {
            index,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    fn notify_delete(&self, index: IndexId, key: &[u8]) {
        self.events.lock().push(RecordedEvent::Delete {
            index,
            key: key.to_vec(),
        });
    }

    fn notify_rename(&self, index: IndexId, new_name: &[u8]) {
        self.events.lock().push(RecordedEvent::Rename {
            index,
            new_name: new_name.to_vec(),
        });
    }

    fn notify_drop(&self, index: IndexId) {
        self.events.lock().push(RecordedEvent::Drop { index });
    }
}

/// A `ReplicationController` that drops the leader-promotion notification,
/// for tests and demos with no group membership to coordinate with.
#[derive(Default)]
pub struct NoopReplicationController;

impl NoopReplicationController {
    pub fn new() -> Self {
        Self
    }
}

impl ReplicationController for NoopReplicationController {
    fn leader_notify(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_store_events_in_order() {
        let manager = RecordingReplicationManager::new();
        manager.notify_store(IndexId::new(1), b"a", b"1");
        manager.notify_store(IndexId::new(1), b"b", b"2");
        assert_eq!(manager.events().len(), 2);
    }
}
