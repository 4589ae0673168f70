//! Redo record format.
//!
//! Each record is one opcode byte followed by its arguments: varints for
//! ids, positions, and lengths; raw bytes for keys and values. All
//! fixed-width integers are little-endian. The encoding is bit-stable across
//! releases because it is read back by recovery.
//!
//! Segment files begin with a 28-byte header: magic (8), file number (8),
//! base position (8), CRC32 of the preceding 24 bytes (4). A record's
//! position is the base position of its file plus its byte offset past the
//! header; positions identify the END of a record, so a transaction is
//! durable once the synced position reaches its commit record's position.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{IndexId, TxnId};
use boreal_common::varint;
use bytes::{Buf, BufMut};

/// Magic value at the start of every redo segment file.
pub const SEGMENT_MAGIC: u64 = 0x4252_4c52_4544_4f31; // "BRLREDO1"

/// Byte length of the segment file header.
pub const SEGMENT_HEADER_LEN: usize = 28;

const OP_TIMESTAMP: u8 = 0x01;
const OP_RESET: u8 = 0x02;
const OP_END_FILE: u8 = 0x03;

const OP_STORE: u8 = 0x10;
const OP_STORE_NO_LOCK: u8 = 0x11;
const OP_RENAME_INDEX: u8 = 0x12;
const OP_DELETE_INDEX: u8 = 0x13;

const OP_TXN_ENTER: u8 = 0x20;
const OP_TXN_STORE: u8 = 0x21;
const OP_TXN_DELETE: u8 = 0x22;
const OP_TXN_ROLLBACK: u8 = 0x23;
const OP_TXN_ROLLBACK_FINAL: u8 = 0x24;
const OP_TXN_COMMIT: u8 = 0x25;
const OP_TXN_COMMIT_FINAL: u8 = 0x26;
const OP_TXN_STORE_COMMIT: u8 = 0x27;
const OP_TXN_STORE_COMMIT_FINAL: u8 = 0x28;
const OP_TXN_PREPARE: u8 = 0x29;
const OP_TXN_CUSTOM: u8 = 0x2A;
const OP_TXN_CUSTOM_LOCK: u8 = 0x2B;

const OP_CURSOR_REGISTER: u8 = 0x30;
const OP_CURSOR_UNREGISTER: u8 = 0x31;
const OP_CURSOR_FIND: u8 = 0x32;
const OP_CURSOR_STORE: u8 = 0x33;
const OP_CURSOR_DELETE: u8 = 0x34;
const OP_CURSOR_STORE_COMMIT: u8 = 0x35;
const OP_CURSOR_STORE_COMMIT_FINAL: u8 = 0x36;
const OP_CURSOR_VALUE_SET_LENGTH: u8 = 0x37;
const OP_CURSOR_VALUE_WRITE: u8 = 0x38;
const OP_CURSOR_VALUE_CLEAR: u8 = 0x39;

const OP_LOCK_SHARED: u8 = 0x40;
const OP_LOCK_UPGRADABLE: u8 = 0x41;
const OP_LOCK_EXCLUSIVE: u8 = 0x42;

/// A decoded redo operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    /// Wall-clock marker, written when a log file is opened and on clean
    /// shutdown.
    Timestamp { millis: u64 },
    /// All transactions implicitly rolled back; written when a leader
    /// restarts the stream.
    Reset,
    /// Clean end of the current segment file.
    EndFile,

    /// Auto-committed store outside any transaction.
    Store { index: IndexId, key: Vec<u8>, value: Option<Vec<u8>> },
    /// Store that skipped lock acquisition.
    StoreNoLock { index: IndexId, key: Vec<u8>, value: Option<Vec<u8>> },
    RenameIndex { index: IndexId, new_name: Vec<u8> },
    DeleteIndex { txn: TxnId, index: IndexId },

    TxnEnter { txn: TxnId },
    TxnStore { txn: TxnId, index: IndexId, key: Vec<u8>, value: Option<Vec<u8>> },
    TxnDelete { txn: TxnId, index: IndexId, key: Vec<u8> },
    /// Rollback of the current scope.
    TxnRollback { txn: TxnId },
    /// Rollback of the whole transaction.
    TxnRollbackFinal { txn: TxnId },
    /// Commit of the current scope.
    TxnCommit { txn: TxnId },
    /// Commit of the whole transaction.
    TxnCommitFinal { txn: TxnId },
    TxnStoreCommit { txn: TxnId, index: IndexId, key: Vec<u8>, value: Option<Vec<u8>> },
    TxnStoreCommitFinal { txn: TxnId, index: IndexId, key: Vec<u8>, value: Option<Vec<u8>> },
    TxnPrepare { txn: TxnId },
    TxnCustom { txn: TxnId, message: Vec<u8> },
    TxnCustomLock { txn: TxnId, index: IndexId, key: Vec<u8>, message: Vec<u8> },

    CursorRegister { cursor: u64, index: IndexId },
    CursorUnregister { cursor: u64 },
    CursorFind { cursor: u64, txn: TxnId, key: Vec<u8> },
    CursorStore { cursor: u64, txn: TxnId, key: Vec<u8>, value: Option<Vec<u8>> },
    CursorDelete { cursor: u64, txn: TxnId, key: Vec<u8> },
    CursorStoreCommit { cursor: u64, txn: TxnId, key: Vec<u8>, value: Option<Vec<u8>> },
    CursorStoreCommitFinal { cursor: u64, txn: TxnId, key: Vec<u8>, value: Option<Vec<u8>> },
    CursorValueSetLength { cursor: u64, txn: TxnId, length: u64 },
    CursorValueWrite { cursor: u64, txn: TxnId, pos: u64, data: Vec<u8> },
    CursorValueClear { cursor: u64, txn: TxnId, pos: u64, length: u64 },

    LockShared { txn: TxnId, index: IndexId, key: Vec<u8> },
    LockUpgradable { txn: TxnId, index: IndexId, key: Vec<u8> },
    LockExclusive { txn: TxnId, index: IndexId, key: Vec<u8> },
}

/// Values are nullable: a store of None is a delete. Encoded as a length
/// varint biased by one, where 0 means null.
fn put_opt_bytes(buf: &mut Vec<u8>, value: &Option<Vec<u8>>) {
    match value {
        None => varint::put_u64(buf, 0),
        Some(v) => {
            varint::put_u64(buf, v.len() as u64 + 1);
            buf.put_slice(v);
        }
    }
}

fn get_opt_bytes(buf: &mut &[u8]) -> Result<Option<Vec<u8>>> {
    let biased = varint::get_u64(buf)?;
    if biased == 0 {
        return Ok(None);
    }
    let len = (biased - 1) as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let mut v = vec![0u8; len];
    buf.copy_to_slice(&mut v);
    Ok(Some(v))
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    varint::put_u64(buf, data.len() as u64);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = varint::get_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let mut v = vec![0u8; len];
    buf.copy_to_slice(&mut v);
    Ok(v)
}

fn truncated() -> BorealError {
    BorealError::Corrupt("truncated redo record".to_string())
}

impl RedoOp {
    /// Appends the encoded record to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        use RedoOp::*;
        match self {
            Timestamp { millis } => {
                buf.put_u8(OP_TIMESTAMP);
                varint::put_u64(buf, *millis);
            }
            Reset => buf.put_u8(OP_RESET),
            EndFile => buf.put_u8(OP_END_FILE),

            Store { index, key, value } => {
                buf.put_u8(OP_STORE);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            StoreNoLock { index, key, value } => {
                buf.put_u8(OP_STORE_NO_LOCK);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            RenameIndex { index, new_name } => {
                buf.put_u8(OP_RENAME_INDEX);
                varint::put_u64(buf, index.0);
                put_bytes(buf, new_name);
            }
            DeleteIndex { txn, index } => {
                buf.put_u8(OP_DELETE_INDEX);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
            }

            TxnEnter { txn } => {
                buf.put_u8(OP_TXN_ENTER);
                varint::put_u64(buf, txn.0);
            }
            TxnStore { txn, index, key, value } => {
                buf.put_u8(OP_TXN_STORE);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            TxnDelete { txn, index, key } => {
                buf.put_u8(OP_TXN_DELETE);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
            }
            TxnRollback { txn } => {
                buf.put_u8(OP_TXN_ROLLBACK);
                varint::put_u64(buf, txn.0);
            }
            TxnRollbackFinal { txn } => {
                buf.put_u8(OP_TXN_ROLLBACK_FINAL);
                varint::put_u64(buf, txn.0);
            }
            TxnCommit { txn } => {
                buf.put_u8(OP_TXN_COMMIT);
                varint::put_u64(buf, txn.0);
            }
            TxnCommitFinal { txn } => {
                buf.put_u8(OP_TXN_COMMIT_FINAL);
                varint::put_u64(buf, txn.0);
            }
            TxnStoreCommit { txn, index, key, value } => {
                buf.put_u8(OP_TXN_STORE_COMMIT);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            TxnStoreCommitFinal { txn, index, key, value } => {
                buf.put_u8(OP_TXN_STORE_COMMIT_FINAL);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            TxnPrepare { txn } => {
                buf.put_u8(OP_TXN_PREPARE);
                varint::put_u64(buf, txn.0);
            }
            TxnCustom { txn, message } => {
                buf.put_u8(OP_TXN_CUSTOM);
                varint::put_u64(buf, txn.0);
                put_bytes(buf, message);
            }
            TxnCustomLock { txn, index, key, message } => {
                buf.put_u8(OP_TXN_CUSTOM_LOCK);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
                put_bytes(buf, message);
            }

            CursorRegister { cursor, index } => {
                buf.put_u8(OP_CURSOR_REGISTER);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, index.0);
            }
            CursorUnregister { cursor } => {
                buf.put_u8(OP_CURSOR_UNREGISTER);
                varint::put_u64(buf, *cursor);
            }
            CursorFind { cursor, txn, key } => {
                buf.put_u8(OP_CURSOR_FIND);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                put_bytes(buf, key);
            }
            CursorStore { cursor, txn, key, value } => {
                buf.put_u8(OP_CURSOR_STORE);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            CursorDelete { cursor, txn, key } => {
                buf.put_u8(OP_CURSOR_DELETE);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                put_bytes(buf, key);
            }
            CursorStoreCommit { cursor, txn, key, value } => {
                buf.put_u8(OP_CURSOR_STORE_COMMIT);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            CursorStoreCommitFinal { cursor, txn, key, value } => {
                buf.put_u8(OP_CURSOR_STORE_COMMIT_FINAL);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                put_bytes(buf, key);
                put_opt_bytes(buf, value);
            }
            CursorValueSetLength { cursor, txn, length } => {
                buf.put_u8(OP_CURSOR_VALUE_SET_LENGTH);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, *length);
            }
            CursorValueWrite { cursor, txn, pos, data } => {
                buf.put_u8(OP_CURSOR_VALUE_WRITE);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, *pos);
                put_bytes(buf, data);
            }
            CursorValueClear { cursor, txn, pos, length } => {
                buf.put_u8(OP_CURSOR_VALUE_CLEAR);
                varint::put_u64(buf, *cursor);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, *pos);
                varint::put_u64(buf, *length);
            }

            LockShared { txn, index, key } => {
                buf.put_u8(OP_LOCK_SHARED);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
            }
            LockUpgradable { txn, index, key } => {
                buf.put_u8(OP_LOCK_UPGRADABLE);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
            }
            LockExclusive { txn, index, key } => {
                buf.put_u8(OP_LOCK_EXCLUSIVE);
                varint::put_u64(buf, txn.0);
                varint::put_u64(buf, index.0);
                put_bytes(buf, key);
            }
        }
    }

    /// Decodes one record from the front of `buf`, advancing it past the
    /// record. Fails on truncation or an unknown opcode.
    pub fn decode(buf: &mut &[u8]) -> Result<RedoOp> {
        use RedoOp::*;
        if !buf.has_remaining() {
            return Err(truncated());
        }
        let opcode = buf.get_u8();
        let op = match opcode {
            OP_TIMESTAMP => Timestamp { millis: varint::get_u64(buf)? },
            OP_RESET => Reset,
            OP_END_FILE => EndFile,

            OP_STORE => Store {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_STORE_NO_LOCK => StoreNoLock {
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_RENAME_INDEX => RenameIndex {
                index: IndexId(varint::get_u64(buf)?),
                new_name: get_bytes(buf)?,
            },
            OP_DELETE_INDEX => DeleteIndex {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
            },

            OP_TXN_ENTER => TxnEnter { txn: TxnId(varint::get_u64(buf)?) },
            OP_TXN_STORE => TxnStore {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_TXN_DELETE => TxnDelete {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },
            OP_TXN_ROLLBACK => TxnRollback { txn: TxnId(varint::get_u64(buf)?) },
            OP_TXN_ROLLBACK_FINAL => TxnRollbackFinal { txn: TxnId(varint::get_u64(buf)?) },
            OP_TXN_COMMIT => TxnCommit { txn: TxnId(varint::get_u64(buf)?) },
            OP_TXN_COMMIT_FINAL => TxnCommitFinal { txn: TxnId(varint::get_u64(buf)?) },
            OP_TXN_STORE_COMMIT => TxnStoreCommit {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_TXN_STORE_COMMIT_FINAL => TxnStoreCommitFinal {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_TXN_PREPARE => TxnPrepare { txn: TxnId(varint::get_u64(buf)?) },
            OP_TXN_CUSTOM => TxnCustom {
                txn: TxnId(varint::get_u64(buf)?),
                message: get_bytes(buf)?,
            },
            OP_TXN_CUSTOM_LOCK => TxnCustomLock {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                message: get_bytes(buf)?,
            },

            OP_CURSOR_REGISTER => CursorRegister {
                cursor: varint::get_u64(buf)?,
                index: IndexId(varint::get_u64(buf)?),
            },
            OP_CURSOR_UNREGISTER => CursorUnregister { cursor: varint::get_u64(buf)? },
            OP_CURSOR_FIND => CursorFind {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },
            OP_CURSOR_STORE => CursorStore {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_CURSOR_DELETE => CursorDelete {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },
            OP_CURSOR_STORE_COMMIT => CursorStoreCommit {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_CURSOR_STORE_COMMIT_FINAL => CursorStoreCommitFinal {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
                value: get_opt_bytes(buf)?,
            },
            OP_CURSOR_VALUE_SET_LENGTH => CursorValueSetLength {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                length: varint::get_u64(buf)?,
            },
            OP_CURSOR_VALUE_WRITE => CursorValueWrite {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                pos: varint::get_u64(buf)?,
                data: get_bytes(buf)?,
            },
            OP_CURSOR_VALUE_CLEAR => CursorValueClear {
                cursor: varint::get_u64(buf)?,
                txn: TxnId(varint::get_u64(buf)?),
                pos: varint::get_u64(buf)?,
                length: varint::get_u64(buf)?,
            },

            OP_LOCK_SHARED => LockShared {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },
            OP_LOCK_UPGRADABLE => LockUpgradable {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },
            OP_LOCK_EXCLUSIVE => LockExclusive {
                txn: TxnId(varint::get_u64(buf)?),
                index: IndexId(varint::get_u64(buf)?),
                key: get_bytes(buf)?,
            },

            other => {
                return Err(BorealError::Corrupt(format!(
                    "unknown redo opcode: {:#04x}",
                    other
                )))
            }
        };
        Ok(op)
    }
}

/// Encodes a segment file header.
pub fn encode_segment_header(file_num: u64, base_position: u64) -> [u8; SEGMENT_HEADER_LEN] {
    let mut buf = [0u8; SEGMENT_HEADER_LEN];
    buf[0..8].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    buf[8..16].copy_from_slice(&file_num.to_le_bytes());
    buf[16..24].copy_from_slice(&base_position.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..24]);
    buf[24..28].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes and verifies a segment file header, returning (file_num,
/// base_position).
pub fn decode_segment_header(buf: &[u8]) -> Result<(u64, u64)> {
    if buf.len() < SEGMENT_HEADER_LEN {
        return Err(BorealError::Corrupt("redo segment header too short".to_string()));
    }
    let magic = u64::from_le_bytes(buf[0..8].try_into().expect("slice len"));
    if magic != SEGMENT_MAGIC {
        return Err(BorealError::Corrupt("bad redo segment magic".to_string()));
    }
    let crc = u32::from_le_bytes(buf[24..28].try_into().expect("slice len"));
    if crc != crc32fast::hash(&buf[0..24]) {
        return Err(BorealError::Corrupt("redo segment header checksum mismatch".to_string()));
    }
    let file_num = u64::from_le_bytes(buf[8..16].try_into().expect("slice len"));
    let base_position = u64::from_le_bytes(buf[16..24].try_into().expect("slice len"));
    Ok((file_num, base_position))
}
