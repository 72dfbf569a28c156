//! `ReplRedoDecoder`: a pull-parser over a byte stream of redo records,
//! invoking the matching `ReplayVisitor` method for each decoded record
//! (spec.md §4.3). Single reader thread; not concurrency-safe.

use common::{IndexId, TxnId};
use redo::RedoOp;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated record at offset {0}")]
    Truncated(usize),
    #[error("unknown opcode byte {0}")]
    UnknownOpcode(u8),
    #[error("zero index id in decoded record")]
    ZeroIndexId,
}

#[derive(Debug, Clone)]
pub enum DecodedRecord {
    Reset,
    Timestamp { value: i64 },
    Shutdown,
    Close,
    EndFile,
    NopRandom { nonce: u64 },
    Store { index: IndexId, key: Vec<u8>, value: Vec<u8> },
    Delete { index: IndexId, key: Vec<u8> },
    StoreNoLock { index: IndexId, key: Vec<u8>, value: Vec<u8> },
    DeleteNoLock { index: IndexId, key: Vec<u8> },
    RenameIndex { index: IndexId, new_name: Vec<u8> },
    DeleteIndex { index: IndexId },
    TxnEnter { txn: TxnId },
    TxnRollback { txn: TxnId },
    TxnRollbackFinal { txn: TxnId },
    TxnCommit { txn: TxnId },
    TxnCommitFinal { txn: TxnId },
    TxnStore { txn: TxnId, index: IndexId, key: Vec<u8>, value: Vec<u8> },
    TxnStoreCommitFinal { txn: TxnId, index: IndexId, key: Vec<u8>, value: Vec<u8> },
    TxnDelete { txn: TxnId, index: IndexId, key: Vec<u8> },
    TxnDeleteCommitFinal { txn: TxnId, index: IndexId, key: Vec<u8> },
    TxnLockShared { txn: TxnId, index: IndexId, key: Vec<u8> },
    TxnLockUpgradable { txn: TxnId, index: IndexId, key: Vec<u8> },
    TxnLockExclusive { txn: TxnId, index: IndexId, key: Vec<u8> },
    TxnCustom { txn: TxnId, payload: Vec<u8> },
    TxnCustomLock { txn: TxnId, index: IndexId, key: Vec<u8>, payload: Vec<u8> },
}

/// Decodes one record at a time from an in-memory buffer. The replicated
/// stream uses 4-byte terminators to delimit records; `ReplRedoDecoder`
/// consumes and validates them but does not surface them as records.
pub struct ReplRedoDecoder<'a> {
    buf: &'a [u8],
    cursor: usize,
    last_txn_id: i64,
    has_terminators: bool,
}

impl<'a> ReplRedoDecoder<'a> {
    pub fn new(buf: &'a [u8], has_terminators: bool) -> Self {
        Self {
            buf,
            cursor: 0,
            last_txn_id: 0,
            has_terminators,
        }
    }

    pub fn stream_position(&self) -> usize {
        self.cursor
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.cursor..]
    }

    fn take_varint(&mut self) -> Result<u64, DecodeError> {
        let (v, len) =
            redo::encode::read_unsigned_varint(self.remaining()).ok_or(DecodeError::Truncated(self.cursor))?;
        self.cursor += len;
        Ok(v)
    }

    fn take_varlong(&mut self) -> Result<i64, DecodeError> {
        let (v, len) =
            redo::encode::read_signed_varlong(self.remaining()).ok_or(DecodeError::Truncated(self.cursor))?;
        self.cursor += len;
        Ok(v)
    }

    fn take_i64(&mut self) -> Result<i64, DecodeError> {
        let v = redo::encode::read_i64_le(self.remaining()).ok_or(DecodeError::Truncated(self.cursor))?;
        self.cursor += 8;
        Ok(v)
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let (data, len) =
            redo::encode::read_bytes_with_len(self.remaining()).ok_or(DecodeError::Truncated(self.cursor))?;
        let owned = data.to_vec();
        self.cursor += len;
        Ok(owned)
    }

    fn take_index_id(&mut self) -> Result<IndexId, DecodeError> {
        let raw = self.take_i64()? as u64;
        IndexId::try_new(raw).ok_or(DecodeError::ZeroIndexId)
    }

    fn take_txn_delta(&mut self) -> Result<TxnId, DecodeError> {
        let delta = self.take_varlong()?;
        let id = self.last_txn_id + delta;
        self.last_txn_id = id;
        Ok(TxnId::from(id))
    }

    fn take_terminator_if_present(&mut self) -> Result<(), DecodeError> {
        if self.has_terminators {
            if self.remaining().len() < 4 {
                return Err(DecodeError::Truncated(self.cursor));
            }
            self.cursor += 4;
        }
        Ok(())
    }

    /// Decodes the next record, or `None` at end of buffer.
    pub fn next(&mut self) -> Result<Option<DecodedRecord>, DecodeError> {
        if self.remaining().is_empty() {
            return Ok(None);
        }
        let opcode_byte = self.remaining()[0];
        self.cursor += 1;
        let op = RedoOp::from_byte(opcode_byte).ok_or(DecodeError::UnknownOpcode(opcode_byte))?;

        let record = match op {
            RedoOp::Reset => {
                self.last_txn_id = 0;
                DecodedRecord::Reset
            }
            RedoOp::Timestamp => DecodedRecord::Timestamp { value: self.take_i64()? },
            RedoOp::Shutdown => DecodedRecord::Shutdown,
            RedoOp::Close => DecodedRecord::Close,
            RedoOp::EndFile => DecodedRecord::EndFile,
            RedoOp::NopRandom => DecodedRecord::NopRandom { nonce: self.take_varint()? },
            RedoOp::Store => {
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                let value = self.take_bytes()?;
                DecodedRecord::Store { index, key, value }
            }
            RedoOp::Delete => {
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::Delete { index, key }
            }
            RedoOp::StoreNoLock => {
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                let value = self.take_bytes()?;
                DecodedRecord::StoreNoLock { index, key, value }
            }
            RedoOp::DeleteNoLock => {
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::DeleteNoLock { index, key }
            }
            RedoOp::RenameIndex => {
                let index = self.take_index_id()?;
                let new_name = self.take_bytes()?;
                DecodedRecord::RenameIndex { index, new_name }
            }
            RedoOp::DeleteIndex => DecodedRecord::DeleteIndex { index: self.take_index_id()? },
            RedoOp::TxnEnter => DecodedRecord::TxnEnter { txn: self.take_txn_delta()? },
            RedoOp::TxnRollback => DecodedRecord::TxnRollback { txn: self.take_txn_delta()? },
            RedoOp::TxnRollbackFinal => DecodedRecord::TxnRollbackFinal { txn: self.take_txn_delta()? },
            RedoOp::TxnCommit => DecodedRecord::TxnCommit { txn: self.take_txn_delta()? },
            RedoOp::TxnCommitFinal => DecodedRecord::TxnCommitFinal { txn: self.take_txn_delta()? },
            RedoOp::TxnStore => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                let value = self.take_bytes()?;
                DecodedRecord::TxnStore { txn, index, key, value }
            }
            RedoOp::TxnStoreCommitFinal => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                let value = self.take_bytes()?;
                DecodedRecord::TxnStoreCommitFinal { txn, index, key, value }
            }
            RedoOp::TxnDelete => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::TxnDelete { txn, index, key }
            }
            RedoOp::TxnDeleteCommitFinal => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::TxnDeleteCommitFinal { txn, index, key }
            }
            RedoOp::TxnLockShared => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::TxnLockShared { txn, index, key }
            }
            RedoOp::TxnLockUpgradable => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::TxnLockUpgradable { txn, index, key }
            }
            RedoOp::TxnLockExclusive => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                DecodedRecord::TxnLockExclusive { txn, index, key }
            }
            RedoOp::TxnCustom => {
                let txn = self.take_txn_delta()?;
                let payload = self.take_bytes()?;
                DecodedRecord::TxnCustom { txn, payload }
            }
            RedoOp::TxnCustomLock => {
                let txn = self.take_txn_delta()?;
                let index = self.take_index_id()?;
                let key = self.take_bytes()?;
                let payload = self.take_bytes()?;
                DecodedRecord::TxnCustomLock { txn, index, key, payload }
            }
        };

        self.take_terminator_if_present()?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redo::encode::{write_bytes_with_len, write_i64_le, write_signed_varlong};

    #[test]
    fn decodes_store_record() {
        let mut buf = Vec::new();
        buf.push(RedoOp::Store.as_byte());
        write_i64_le(7, &mut buf);
        write_bytes_with_len(b"k", &mut buf);
        write_bytes_with_len(b"v", &mut buf);

        let mut decoder = ReplRedoDecoder::new(&buf, false);
        let record = decoder.next().unwrap().unwrap();
        match record {
            DecodedRecord::Store { index, key, value } => {
                assert_eq!(index.get(), 7);
                assert_eq!(key, b"k");
                assert_eq!(value, b"v");
            }
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn decodes_txn_delta_relative_to_stream_state() {
        let mut buf = Vec::new();
        buf.push(RedoOp::TxnEnter.as_byte());
        write_signed_varlong(5, &mut buf);
        buf.push(RedoOp::TxnCommitFinal.as_byte());
        write_signed_varlong(0, &mut buf);

        let mut decoder = ReplRedoDecoder::new(&buf, false);
        let first = decoder.next().unwrap().unwrap();
        let second = decoder.next().unwrap().unwrap();
        match (first, second) {
            (DecodedRecord::TxnEnter { txn: a }, DecodedRecord::TxnCommitFinal { txn: b }) => {
                assert_eq!(a, TxnId::from(5));
                assert_eq!(b, TxnId::from(5));
            }
            other => panic!("unexpected records: {other:?}"),
        }
    }

    #[test]
    fn reset_zeroes_stream_txn_state() {
        let mut buf = Vec::new();
        buf.push(RedoOp::TxnEnter.as_byte());
        write_signed_varlong(5, &mut buf);
        buf.push(RedoOp::Reset.as_byte());
        buf.push(RedoOp::TxnEnter.as_byte());
        write_signed_varlong(3, &mut buf);

        let mut decoder = ReplRedoDecoder::new(&buf, false);
        decoder.next().unwrap();
        decoder.next().unwrap();
        let record = decoder.next().unwrap().unwrap();
        match record {
            DecodedRecord::TxnEnter { txn } => assert_eq!(txn, TxnId::from(3)),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn truncated_record_reports_error() {
        let buf = vec![RedoOp::Store.as_byte()];
        let mut decoder = ReplRedoDecoder::new(&buf, false);
        assert!(matches!(decoder.next(), Err(DecodeError::Truncated(_))));
    }
}
