use serde::{Deserialize, Serialize};

/// Durability requested for a single redo call. Ordered loosely from
/// strongest to weakest guarantee; `RedoWriter::op_write_check` may
/// downgrade a requested mode but never upgrade it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// The record must be durable (fsync'd) before the call returns.
    Sync,
    /// The record must be in the writer's buffer before the call returns;
    /// durability is eventual.
    NoSync,
    /// The record may remain in the shared redo buffer.
    NoFlush,
    /// The record is not appended to the redo stream at all.
    NoRedo,
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Sync
    }
}

impl DurabilityMode {
    /// Whether this mode requires the context to append anything to the
    /// redo stream at all.
    pub fn is_redo(self) -> bool {
        !matches!(self, DurabilityMode::NoRedo)
    }
}
