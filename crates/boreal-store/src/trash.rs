//! Persisted collection of fragmented values pending deletion.
//!
//! A fragmented value deleted under a transaction cannot be freed
//! immediately, because rollback must restore it. The descriptor moves
//! into an internal trash tree instead, keyed by the transaction id
//! followed by a reverse-ordered sequence number, so newer entries for a
//! transaction sort first. Commit empties the transaction's trash,
//! freeing the value pages; rollback moves entries back into their index;
//! recovery reclaims whatever is left for transactions that committed.

use boreal_common::error::Result;
use boreal_common::types::{IndexId, TxnId};
use boreal_common::varint;
use std::sync::Arc;

use crate::fragment;
use crate::store::PageStore;
use crate::tree::{NewValue, Seek, StoredValue, Tree};
use crate::undo::{UndoLog, UndoOp};

/// Trash entries and their undo records for staged fragmented deletes.
pub struct FragmentedTrash {
    pub tree: Arc<Tree>,
}

impl FragmentedTrash {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self { tree }
    }

    fn prefix(txn_id: TxnId) -> Vec<u8> {
        txn_id.0.to_be_bytes().to_vec()
    }

    /// Moves a fragmented value into the trash and pushes the matching
    /// undo record. Returns nothing; the undo payload carries the index
    /// key and the trash suffix needed to find the entry again.
    pub fn add(
        &self,
        store: &PageStore,
        undo: &mut UndoLog,
        txn_id: TxnId,
        index: IndexId,
        index_key: &[u8],
        desc: Vec<u8>,
    ) -> Result<()> {
        let prefix = Self::prefix(txn_id);
        // Newer entries have higher sequence numbers and sort first under
        // the reverse encoding.
        let next_seq = match self.tree.seek(store, &prefix, Seek::Ge)? {
            Some((key, _)) if key.len() > 8 && key[..8] == prefix[..] => {
                varint::get_reverse_u64(&key[8..])?.0 + 1
            }
            _ => 1,
        };
        let mut trash_key = prefix;
        varint::put_reverse_u64(&mut trash_key, next_seq);

        self.tree.store(store, &trash_key, NewValue::Desc(desc))?;
        undo.push(
            store,
            UndoOp::UndeleteFragmented {
                index,
                key: index_key.to_vec(),
                trash_suffix: trash_key[8..].to_vec(),
            },
        )?;
        Ok(())
    }

    /// Restores a trashed value into its index as an undo action.
    pub fn remove(
        &self,
        store: &PageStore,
        txn_id: TxnId,
        index_tree: &Tree,
        index_key: &[u8],
        trash_suffix: &[u8],
    ) -> Result<()> {
        let mut trash_key = Self::prefix(txn_id);
        trash_key.extend_from_slice(trash_suffix);

        let desc = match self.tree.load(store, &trash_key)? {
            Some(StoredValue::Fragmented(desc)) => desc,
            // Nothing to restore; a double undo leaves no entry behind.
            _ => return Ok(()),
        };
        // The descriptor's ownership transfers back to the index entry, so
        // the trash entry is removed without freeing the fragments.
        self.tree.store(store, &trash_key, NewValue::Remove)?;
        if let Some(StoredValue::Fragmented(displaced)) =
            index_tree.store(store, index_key, NewValue::Desc(desc))?
        {
            // A later operation of the same transaction left its own
            // fragmented value behind; rolling past it frees it.
            fragment::free(store, &displaced)?;
        }
        Ok(())
    }

    /// Non-transactionally frees all trash for one committed transaction.
    pub fn empty(&self, store: &PageStore, txn_id: TxnId) -> Result<usize> {
        let prefix = Self::prefix(txn_id);
        let mut freed = 0;
        loop {
            match self.tree.seek(store, &prefix, Seek::Ge)? {
                Some((key, StoredValue::Fragmented(desc)))
                    if key.len() > 8 && key[..8] == prefix[..] =>
                {
                    fragment::free(store, &desc)?;
                    self.tree.store(store, &key, NewValue::Remove)?;
                    freed += 1;
                }
                _ => return Ok(freed),
            }
        }
    }

    /// Frees every remaining trash entry; used by recovery after
    /// unfinished transactions have been rolled back.
    pub fn empty_all(&self, store: &PageStore) -> Result<usize> {
        let mut freed = 0;
        loop {
            match self.tree.first(store)? {
                Some((key, StoredValue::Fragmented(desc))) => {
                    fragment::free(store, &desc)?;
                    self.tree.store(store, &key, NewValue::Remove)?;
                    freed += 1;
                }
                Some((key, _)) => {
                    self.tree.store(store, &key, NewValue::Remove)?;
                    freed += 1;
                }
                None => return Ok(freed),
            }
        }
    }

    /// True if any trash remains for the transaction.
    pub fn has_entries(&self, store: &PageStore, txn_id: TxnId) -> Result<bool> {
        let prefix = Self::prefix(txn_id);
        Ok(matches!(
            self.tree.seek(store, &prefix, Seek::Ge)?,
            Some((key, _)) if key.len() > 8 && key[..8] == prefix[..]
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PageAllocator;
    use crate::cache::NodeCache;
    use crate::pagearray::{MemPageArray, PageArray, SnapshotPageArray};
    use boreal_common::types::PageId;

    fn mem_store() -> PageStore {
        let inner: Arc<dyn PageArray> = Arc::new(MemPageArray::new(512));
        let pages = Arc::new(SnapshotPageArray::new(inner));
        pages.set_page_count(2).unwrap();
        PageStore::new(pages, PageAllocator::new(2), NodeCache::new(100))
    }

    fn setup() -> (PageStore, FragmentedTrash, Arc<Tree>) {
        let store = mem_store();
        let trash = FragmentedTrash::new(Arc::new(Tree::new(IndexId(1), PageId::NONE, false)));
        let index = Arc::new(Tree::new(IndexId(10), PageId::NONE, false));
        (store, trash, index)
    }

    fn frag_value(store: &PageStore, byte: u8) -> Vec<u8> {
        fragment::create(store, &vec![byte; 2000]).unwrap()
    }

    #[test]
    fn test_add_assigns_descending_sequence() {
        let (store, trash, _) = setup();
        let mut undo = UndoLog::new();
        let txn = TxnId(5);

        trash
            .add(&store, &mut undo, txn, IndexId(10), b"k1", frag_value(&store, 1))
            .unwrap();
        trash
            .add(&store, &mut undo, txn, IndexId(10), b"k2", frag_value(&store, 2))
            .unwrap();

        // The newest entry sorts first within the transaction's prefix.
        let (first_key, _) = trash.tree.seek(&store, &TxnId(5).0.to_be_bytes(), Seek::Ge)
            .unwrap()
            .unwrap();
        let (seq, _) = varint::get_reverse_u64(&first_key[8..]).unwrap();
        assert_eq!(seq, 2);

        // Both undo records reference their index keys.
        let op2 = undo.pop(&store).unwrap().unwrap();
        match op2 {
            UndoOp::UndeleteFragmented { key, .. } => assert_eq!(key, b"k2"),
            other => panic!("unexpected undo op {:?}", other),
        }
    }

    #[test]
    fn test_remove_restores_value() {
        let (store, trash, index) = setup();
        let mut undo = UndoLog::new();
        let txn = TxnId(7);
        let desc = frag_value(&store, 9);
        let original = fragment::read_all(&store, &desc).unwrap();

        trash.add(&store, &mut undo, txn, index.id, b"row", desc).unwrap();
        let op = undo.pop(&store).unwrap().unwrap();
        let UndoOp::UndeleteFragmented { key, trash_suffix, .. } = op else {
            panic!("wrong undo op");
        };

        trash.remove(&store, txn, &index, &key, &trash_suffix).unwrap();
        // The index holds the value again and the trash is empty.
        let restored = index.load(&store, b"row").unwrap().unwrap();
        assert_eq!(restored.materialize(&store).unwrap().unwrap(), original);
        assert!(!trash.has_entries(&store, txn).unwrap());

        // Double undo is harmless.
        trash.remove(&store, txn, &index, &key, &trash_suffix).unwrap();
    }

    #[test]
    fn test_empty_frees_one_transaction() {
        let (store, trash, _) = setup();
        let mut undo = UndoLog::new();
        for (txn, b) in [(TxnId(1), 1u8), (TxnId(1), 2), (TxnId(2), 3)] {
            trash
                .add(&store, &mut undo, txn, IndexId(10), b"k", frag_value(&store, b))
                .unwrap();
        }
        let freed = trash.empty(&store, TxnId(1)).unwrap();
        assert_eq!(freed, 2);
        assert!(!trash.has_entries(&store, TxnId(1)).unwrap());
        assert!(trash.has_entries(&store, TxnId(2)).unwrap());
    }

    #[test]
    fn test_empty_all() {
        let (store, trash, _) = setup();
        let mut undo = UndoLog::new();
        for txn in [TxnId(1), TxnId(2), TxnId(3)] {
            trash
                .add(&store, &mut undo, txn, IndexId(10), b"k", frag_value(&store, 1))
                .unwrap();
        }
        assert_eq!(trash.empty_all(&store).unwrap(), 3);
        assert!(trash.tree.first(&store).unwrap().is_none());
    }
}
