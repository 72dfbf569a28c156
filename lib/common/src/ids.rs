//! Identifiers shared across the redo pipeline and the replication replay
//! engine: transaction identifiers and index (keyspace) identifiers.

use serde::{Deserialize, Serialize};
use shrinkwraprs::Shrinkwrap;
use std::fmt;

/// A transaction identifier.
///
/// Identifiers minted by one [`crate::ids::TxnId`]-producing context are
/// strictly increasing and stride by a context-specific positive
/// increment, so that multiple contexts mint disjoint subsequences. `0` is
/// reserved for "no transaction"; negative values are reserved for
/// non-replicated transactions and never appear on the wire.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Shrinkwrap,
)]
pub struct TxnId(pub i64);

impl TxnId {
    /// The reserved "no transaction" value.
    pub const NONE: TxnId = TxnId(0);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Replicated transactions are minted with a positive identifier.
    pub fn is_replicated(self) -> bool {
        self.0 > 0
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({})", self.0)
    }
}

impl From<i64> for TxnId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<TxnId> for i64 {
    fn from(value: TxnId) -> Self {
        value.0
    }
}

/// An opaque identifier naming a keyspace (an index). Never `0`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Shrinkwrap,
)]
pub struct IndexId(pub u64);

impl IndexId {
    /// Constructs an `IndexId`, trusting the caller that `id != 0`. Used on
    /// the decode path where a zero index id would indicate a malformed
    /// stream and is rejected before construction.
    pub fn new(id: u64) -> Self {
        debug_assert_ne!(id, 0, "IndexId must never be 0");
        Self(id)
    }

    /// Fallible constructor for untrusted input (e.g. decoded bytes).
    pub fn try_new(id: u64) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexId({})", self.0)
    }
}

impl From<IndexId> for u64 {
    fn from(value: IndexId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_id_none_is_zero() {
        assert!(TxnId::NONE.is_none());
        assert!(!TxnId::from(1).is_none());
    }

    #[test]
    fn txn_id_replicated_requires_positive() {
        assert!(TxnId::from(1).is_replicated());
        assert!(!TxnId::from(-1).is_replicated());
        assert!(!TxnId::NONE.is_replicated());
    }

    #[test]
    fn index_id_rejects_zero() {
        assert!(IndexId::try_new(0).is_none());
        assert_eq!(IndexId::try_new(7).map(IndexId::get), Some(7));
    }
}
