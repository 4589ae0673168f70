//! Redo log replay.
//!
//! The reader walks segment files in file-number order, decoding records and
//! dispatching each to a `RedoVisitor` along with its stream position. A
//! decode failure or short read at the tail of the last file is the normal
//! signature of a crash mid-write; replay stops there and everything before
//! it is applied.

use boreal_common::error::Result;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::op::{decode_segment_header, RedoOp, SEGMENT_HEADER_LEN};

/// Receives decoded operations during replay.
pub trait RedoVisitor {
    /// Applies one operation. `position` is the stream position one past the
    /// record. Return false to stop replay early.
    fn apply(&mut self, position: u64, op: RedoOp) -> Result<bool>;
}

/// Replays redo segment files through a visitor.
pub struct RedoReader;

impl RedoReader {
    /// Replays files `first_file, first_file+1, ...` resolved through
    /// `path_of`, skipping records at or below `start_position`. Stops at
    /// the first missing file, a clean EndFile with no successor, or a torn
    /// tail. Returns the stream position reached.
    pub fn replay<V, P>(
        path_of: P,
        first_file: u64,
        start_position: u64,
        visitor: &mut V,
    ) -> Result<u64>
    where
        V: RedoVisitor,
        P: Fn(u64) -> PathBuf,
    {
        let mut position = start_position;
        let mut file_num = first_file;

        loop {
            let path = path_of(file_num);
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(file_num, "redo replay complete, next segment absent");
                    return Ok(position);
                }
                Err(e) => return Err(e.into()),
            };

            if bytes.len() < SEGMENT_HEADER_LEN {
                warn!(file_num, "redo segment shorter than header, stopping replay");
                return Ok(position);
            }
            let (num, base) = match decode_segment_header(&bytes) {
                Ok(h) => h,
                Err(_) => {
                    warn!(file_num, "redo segment header invalid, stopping replay");
                    return Ok(position);
                }
            };
            if num != file_num {
                warn!(
                    file_num,
                    found = num,
                    "redo segment numbered inconsistently, stopping replay"
                );
                return Ok(position);
            }

            let mut slice = &bytes[SEGMENT_HEADER_LEN..];
            let mut pos = base;
            let mut reached_end_file = false;

            while !slice.is_empty() {
                let before = slice.len();
                let op = match RedoOp::decode(&mut slice) {
                    Ok(op) => op,
                    Err(_) => {
                        // Torn tail from a crash mid-write.
                        debug!(file_num, position = pos, "redo tail torn, stopping replay");
                        return Ok(position.max(pos));
                    }
                };
                pos += (before - slice.len()) as u64;

                if op == RedoOp::EndFile {
                    reached_end_file = true;
                    break;
                }
                if pos <= start_position {
                    continue;
                }
                if !visitor.apply(pos, op)? {
                    return Ok(pos);
                }
                position = pos;
            }

            position = position.max(pos);
            if !reached_end_file {
                // File ended without a seal; nothing follows it.
                return Ok(position);
            }
            file_num += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::RedoWriter;
    use boreal_common::types::{IndexId, TxnId};
    use tempfile::tempdir;

    struct Collect {
        ops: Vec<(u64, RedoOp)>,
        stop_after: Option<usize>,
    }

    impl Collect {
        fn new() -> Self {
            Self { ops: Vec::new(), stop_after: None }
        }
    }

    impl RedoVisitor for Collect {
        fn apply(&mut self, position: u64, op: RedoOp) -> Result<bool> {
            self.ops.push((position, op));
            Ok(self.stop_after.map(|n| self.ops.len() < n).unwrap_or(true))
        }
    }

    fn sample_ops() -> Vec<RedoOp> {
        vec![
            RedoOp::TxnEnter { txn: TxnId(1) },
            RedoOp::TxnStore {
                txn: TxnId(1),
                index: IndexId(7),
                key: b"k1".to_vec(),
                value: Some(b"v1".to_vec()),
            },
            RedoOp::TxnCommitFinal { txn: TxnId(1) },
        ]
    }

    #[test]
    fn test_replay_single_file() {
        let dir = tempdir().unwrap();
        let path_of = |n: u64| dir.path().join(format!("r.redo.{}", n));

        let writer = RedoWriter::create(path_of(0), 0, 0, false).unwrap();
        for op in sample_ops() {
            writer.append(&op);
        }
        let end = writer.sync().unwrap();

        let mut v = Collect::new();
        let reached = RedoReader::replay(path_of, 0, 0, &mut v).unwrap();
        assert_eq!(reached, end);
        assert_eq!(v.ops.len(), 3);
        assert_eq!(v.ops[0].1, sample_ops()[0]);
        // Positions strictly increase.
        assert!(v.ops.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_replay_across_rotation() {
        let dir = tempdir().unwrap();
        let path_of = |n: u64| dir.path().join(format!("r.redo.{}", n));

        let writer = RedoWriter::create(path_of(0), 0, 0, false).unwrap();
        writer.append(&sample_ops()[0]);
        writer.rotate(path_of(1), 1).unwrap();
        writer.append(&sample_ops()[1]);
        writer.append(&sample_ops()[2]);
        let end = writer.sync().unwrap();

        let mut v = Collect::new();
        let reached = RedoReader::replay(path_of, 0, 0, &mut v).unwrap();
        assert_eq!(reached, end);
        assert_eq!(v.ops.len(), 3);
    }

    #[test]
    fn test_replay_skips_below_start_position() {
        let dir = tempdir().unwrap();
        let path_of = |n: u64| dir.path().join(format!("r.redo.{}", n));

        let writer = RedoWriter::create(path_of(0), 0, 0, false).unwrap();
        let p1 = writer.append(&sample_ops()[0]);
        writer.append(&sample_ops()[1]);
        writer.append(&sample_ops()[2]);
        writer.sync().unwrap();

        let mut v = Collect::new();
        RedoReader::replay(path_of, 0, p1, &mut v).unwrap();
        assert_eq!(v.ops.len(), 2);
        assert!(v.ops.iter().all(|(p, _)| *p > p1));
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path_of = |n: u64| dir.path().join(format!("r.redo.{}", n));

        let writer = RedoWriter::create(path_of(0), 0, 0, false).unwrap();
        writer.append(&sample_ops()[0]);
        let p = writer.append(&sample_ops()[1]);
        writer.sync().unwrap();

        // Chop bytes off the tail to simulate a crash mid-write.
        let file_len = std::fs::metadata(path_of(0)).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(path_of(0)).unwrap();
        f.set_len(file_len - 3).unwrap();

        let mut v = Collect::new();
        let reached = RedoReader::replay(path_of, 0, 0, &mut v).unwrap();
        assert_eq!(v.ops.len(), 1);
        assert!(reached < p);
    }

    #[test]
    fn test_replay_missing_first_file() {
        let dir = tempdir().unwrap();
        let path_of = |n: u64| dir.path().join(format!("r.redo.{}", n));
        let mut v = Collect::new();
        let reached = RedoReader::replay(path_of, 5, 99, &mut v).unwrap();
        assert_eq!(reached, 99);
        assert!(v.ops.is_empty());
    }

    #[test]
    fn test_replay_visitor_early_stop() {
        let dir = tempdir().unwrap();
        let path_of = |n: u64| dir.path().join(format!("r.redo.{}", n));

        let writer = RedoWriter::create(path_of(0), 0, 0, false).unwrap();
        for op in sample_ops() {
            writer.append(&op);
        }
        writer.sync().unwrap();

        let mut v = Collect::new();
        v.stop_after = Some(2);
        RedoReader::replay(path_of, 0, 0, &mut v).unwrap();
        assert_eq!(v.ops.len(), 2);
    }
}
