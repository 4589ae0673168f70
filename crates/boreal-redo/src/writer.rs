//! Redo log writer with group commit.
//!
//! Records are appended to an in-memory buffer under a short mutex and
//! assigned their logical stream position immediately. Flushing moves
//! buffered bytes into the current segment file; syncing additionally
//! issues fsync. Committers in Sync durability block until the synced
//! position reaches their commit record; one syncing thread serves every
//! waiter whose record was buffered before the fsync (group commit).
//!
//! Rotation opens a new segment file whose header records the stream
//! position where it begins, so the stream stays a single total order
//! across files.

use boreal_common::error::{BorealError, Result};
use boreal_sync::condition::{await_on, LatchCondition, WaiterKind, WaitResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::op::{encode_segment_header, RedoOp};

struct Buffered {
    buf: Vec<u8>,
    /// Logical position one past the last buffered byte.
    end_pos: u64,
}

struct SegmentIo {
    file: File,
    file_num: u64,
}

struct SyncState {
    /// Position through which bytes have reached the file.
    flushed_pos: u64,
    /// Position through which bytes are durable.
    synced_pos: u64,
    syncing: bool,
    closed: bool,
    waiters: LatchCondition,
}

/// Thread-safe writer for the redo stream.
pub struct RedoWriter {
    buffer: Mutex<Buffered>,
    io: Mutex<Option<SegmentIo>>,
    sync_state: Mutex<SyncState>,
    fsync_enabled: bool,
}

impl RedoWriter {
    /// Creates a writer starting a new segment file at the given stream
    /// position.
    pub fn create(
        path: PathBuf,
        file_num: u64,
        base_position: u64,
        fsync_enabled: bool,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        file.write_all(&encode_segment_header(file_num, base_position))?;
        if fsync_enabled {
            file.sync_all()?;
        }

        Ok(Self {
            buffer: Mutex::new(Buffered { buf: Vec::new(), end_pos: base_position }),
            io: Mutex::new(Some(SegmentIo { file, file_num })),
            sync_state: Mutex::new(SyncState {
                flushed_pos: base_position,
                synced_pos: base_position,
                syncing: false,
                closed: false,
                waiters: LatchCondition::new(),
            }),
            fsync_enabled,
        })
    }

    /// Creates a writer with no backing file. Positions still advance, and
    /// every position is immediately considered durable. Used by in-memory
    /// databases and by transactions in NoRedo durability.
    pub fn disabled() -> Self {
        Self {
            buffer: Mutex::new(Buffered { buf: Vec::new(), end_pos: 0 }),
            io: Mutex::new(None),
            sync_state: Mutex::new(SyncState {
                flushed_pos: 0,
                synced_pos: 0,
                syncing: false,
                closed: false,
                waiters: LatchCondition::new(),
            }),
            fsync_enabled: false,
        }
    }

    /// Returns true if this writer has a backing file.
    pub fn is_enabled(&self) -> bool {
        self.io.lock().is_some()
    }

    /// Current segment file number.
    pub fn file_num(&self) -> u64 {
        self.io.lock().as_ref().map(|io| io.file_num).unwrap_or(0)
    }

    /// Position one past the last appended record.
    pub fn end_pos(&self) -> u64 {
        self.buffer.lock().end_pos
    }

    /// Position through which the stream is durable.
    pub fn synced_pos(&self) -> u64 {
        self.sync_state.lock().synced_pos
    }

    /// Appends a record and returns its position (the position one past its
    /// final byte).
    pub fn append(&self, op: &RedoOp) -> u64 {
        let mut buffered = self.buffer.lock();
        let before = buffered.buf.len();
        op.encode(&mut buffered.buf);
        buffered.end_pos += (buffered.buf.len() - before) as u64;
        let pos = buffered.end_pos;
        drop(buffered);

        if self.io.lock().is_none() {
            // Disabled writer: everything is durable by definition.
            let mut s = self.sync_state.lock();
            s.flushed_pos = pos;
            s.synced_pos = pos;
        }
        pos
    }

    /// Writes buffered bytes to the segment file without fsync.
    pub fn flush(&self) -> Result<u64> {
        let mut io_guard = self.io.lock();
        self.flush_locked(&mut io_guard)
    }

    fn flush_locked(&self, io_guard: &mut Option<SegmentIo>) -> Result<u64> {
        let (bytes, end_pos) = {
            let mut buffered = self.buffer.lock();
            let end_pos = buffered.end_pos;
            (std::mem::take(&mut buffered.buf), end_pos)
        };
        if let Some(io) = io_guard.as_mut() {
            if !bytes.is_empty() {
                io.file.write_all(&bytes)?;
            }
        }
        let mut s = self.sync_state.lock();
        if end_pos > s.flushed_pos {
            s.flushed_pos = end_pos;
        }
        Ok(s.flushed_pos)
    }

    /// Flushes and fsyncs, advancing the synced position. Wakes every
    /// committer whose record is now durable.
    pub fn sync(&self) -> Result<u64> {
        let flushed = {
            let mut io_guard = self.io.lock();
            let flushed = self.flush_locked(&mut io_guard)?;
            if self.fsync_enabled {
                if let Some(io) = io_guard.as_ref() {
                    io.file.sync_data()?;
                }
            }
            flushed
        };
        let mut s = self.sync_state.lock();
        if flushed > s.synced_pos {
            s.synced_pos = flushed;
        }
        s.waiters.signal_all();
        Ok(s.synced_pos)
    }

    /// Blocks until the stream is durable through `pos`. At most one thread
    /// performs the fsync; the rest wait for its result.
    pub fn commit_sync(&self, pos: u64) -> Result<()> {
        loop {
            let mut s = self.sync_state.lock();
            if s.synced_pos >= pos {
                return Ok(());
            }
            if s.closed {
                return Err(BorealError::Closed);
            }
            if s.syncing {
                let r = await_on(&mut s, |s| &mut s.waiters, WaiterKind::Regular, -1);
                if r == WaitResult::Interrupted {
                    return Err(BorealError::Closed);
                }
                continue;
            }
            s.syncing = true;
            drop(s);

            let result = self.sync();

            let mut s = self.sync_state.lock();
            s.syncing = false;
            s.waiters.signal_all();
            match result {
                Ok(synced) => {
                    if synced >= pos {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ends the current segment and begins a new one at the current stream
    /// position. Used by the checkpointer; records strictly below the new
    /// file's base position live only in superseded files, which the caller
    /// deletes after the checkpoint header is durable. Returns the new base
    /// position.
    pub fn rotate(&self, new_path: PathBuf, new_file_num: u64) -> Result<u64> {
        let mut io_guard = self.io.lock();
        if io_guard.is_none() {
            return Ok(self.buffer.lock().end_pos);
        }

        // Seal the old file.
        let base = {
            let mut buffered = self.buffer.lock();
            let before = buffered.buf.len();
            RedoOp::EndFile.encode(&mut buffered.buf);
            buffered.end_pos += (buffered.buf.len() - before) as u64;
            buffered.end_pos
        };
        self.flush_locked(&mut io_guard)?;
        if self.fsync_enabled {
            if let Some(io) = io_guard.as_ref() {
                io.file.sync_data()?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&new_path)?;
        file.write_all(&encode_segment_header(new_file_num, base))?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        *io_guard = Some(SegmentIo { file, file_num: new_file_num });

        let mut s = self.sync_state.lock();
        if base > s.synced_pos {
            s.synced_pos = base;
        }
        s.flushed_pos = s.flushed_pos.max(base);
        s.waiters.signal_all();
        Ok(base)
    }

    /// Flushes, syncs, and marks the writer closed. Blocked committers are
    /// woken with a closed failure.
    pub fn close(&self) -> Result<()> {
        let result = self.sync();
        let mut s = self.sync_state.lock();
        s.closed = true;
        s.waiters.clear();
        drop(s);
        *self.io.lock() = None;
        result.map(|_| ())
    }
}
