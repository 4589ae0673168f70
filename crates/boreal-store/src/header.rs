//! Double-buffered database header.
//!
//! Pages 0 and 1 each hold a header image. A checkpoint writes the new
//! header to the page not holding the current one, so a crash mid-write
//! leaves the previous header intact. Open validates both images and picks
//! the one with a correct checksum and the higher commit counter.
//!
//! Layout (84 bytes, little-endian):
//! - magic: 8 bytes
//! - version: 4 bytes
//! - page_size: 4 bytes
//! - counter: 8 bytes (increments per checkpoint)
//! - registry_root: 8 bytes
//! - allocator_root: 8 bytes
//! - txn_table_page: 8 bytes
//! - page_count: 8 bytes
//! - redo_file_num: 8 bytes
//! - redo_position: 8 bytes
//! - highest_txn_id: 8 bytes
//! - checksum: 4 bytes (CRC32 of the preceding 80 bytes)

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{PageId, TxnId};

use crate::pagearray::PageArray;

/// Magic value identifying a BorealDB page file.
pub const HEADER_MAGIC: u64 = 0x4252_4c44_4254_5245; // "BRLDBTRE"

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Encoded byte length of a header.
pub const HEADER_LEN: usize = 84;

/// A durable root captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: usize,
    /// Checkpoint commit counter; higher wins at open.
    pub counter: u64,
    /// Root of the registry tree. NONE for an empty database.
    pub registry_root: PageId,
    /// Root of the persisted free list. NONE when the free list is empty.
    pub allocator_root: PageId,
    /// Head of the persisted transaction table. NONE when no transactions
    /// were in flight at the checkpoint.
    pub txn_table_page: PageId,
    /// Total pages in the array at the checkpoint.
    pub page_count: u64,
    /// Redo segment file holding the first record to replay.
    pub redo_file_num: u64,
    /// Stream position replay starts from.
    pub redo_position: u64,
    /// Highest transaction id assigned before the checkpoint.
    pub highest_txn_id: TxnId,
}

impl DbHeader {
    /// Header for a freshly created database.
    pub fn initial(page_size: usize) -> Self {
        Self {
            page_size,
            counter: 0,
            registry_root: PageId::NONE,
            allocator_root: PageId::NONE,
            txn_table_page: PageId::NONE,
            page_count: 2,
            redo_file_num: 0,
            redo_position: 0,
            highest_txn_id: TxnId::UNASSIGNED,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= HEADER_LEN);
        out[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[12..16].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        out[16..24].copy_from_slice(&self.counter.to_le_bytes());
        out[24..32].copy_from_slice(&self.registry_root.0.to_le_bytes());
        out[32..40].copy_from_slice(&self.allocator_root.0.to_le_bytes());
        out[40..48].copy_from_slice(&self.txn_table_page.0.to_le_bytes());
        out[48..56].copy_from_slice(&self.page_count.to_le_bytes());
        out[56..64].copy_from_slice(&self.redo_file_num.to_le_bytes());
        out[64..72].copy_from_slice(&self.redo_position.to_le_bytes());
        out[72..80].copy_from_slice(&self.highest_txn_id.0.to_le_bytes());
        let crc = crc32fast::hash(&out[0..80]);
        out[80..84].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(BorealError::Corrupt("header too short".to_string()));
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().expect("slice len"));
        if magic != HEADER_MAGIC {
            return Err(BorealError::Corrupt("bad header magic".to_string()));
        }
        let crc = u32::from_le_bytes(buf[80..84].try_into().expect("slice len"));
        if crc != crc32fast::hash(&buf[0..80]) {
            return Err(BorealError::Corrupt("header checksum mismatch".to_string()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().expect("slice len"));
        if version != FORMAT_VERSION {
            return Err(BorealError::Corrupt(format!(
                "unsupported format version {}",
                version
            )));
        }
        Ok(Self {
            page_size: u32::from_le_bytes(buf[12..16].try_into().expect("slice len")) as usize,
            counter: u64::from_le_bytes(buf[16..24].try_into().expect("slice len")),
            registry_root: PageId(u64::from_le_bytes(buf[24..32].try_into().expect("slice len"))),
            allocator_root: PageId(u64::from_le_bytes(buf[32..40].try_into().expect("slice len"))),
            txn_table_page: PageId(u64::from_le_bytes(buf[40..48].try_into().expect("slice len"))),
            page_count: u64::from_le_bytes(buf[48..56].try_into().expect("slice len")),
            redo_file_num: u64::from_le_bytes(buf[56..64].try_into().expect("slice len")),
            redo_position: u64::from_le_bytes(buf[64..72].try_into().expect("slice len")),
            highest_txn_id: TxnId(u64::from_le_bytes(buf[72..80].try_into().expect("slice len"))),
        })
    }

    /// Writes this header to the slot not holding the current counter and
    /// syncs. The previous header stays intact until the write completes.
    pub fn write(&self, pages: &dyn PageArray) -> Result<()> {
        let slot = PageId(self.counter & 1);
        let mut buf = vec![0u8; pages.page_size()];
        self.encode(&mut buf);
        pages.write_page(slot, &buf)?;
        pages.sync(true)?;
        Ok(())
    }

    /// Reads both header slots and returns the newest valid one.
    pub fn read(pages: &dyn PageArray) -> Result<Self> {
        let mut buf = vec![0u8; pages.page_size()];
        let mut best: Option<DbHeader> = None;
        for slot in 0..2u64 {
            if slot >= pages.page_count() {
                continue;
            }
            if pages.read_page(PageId(slot), &mut buf).is_err() {
                continue;
            }
            if let Ok(header) = DbHeader::decode(&buf) {
                best = match best {
                    Some(prev) if prev.counter >= header.counter => Some(prev),
                    _ => Some(header),
                };
            }
        }
        best.ok_or_else(|| BorealError::Corrupt("no valid database header".to_string()))
    }
}
