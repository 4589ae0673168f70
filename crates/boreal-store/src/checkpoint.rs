//! Checkpointing.
//!
//! A checkpoint makes the current tree state durable and bounds redo
//! replay. Under the exclusive commit latch it records every open tree's
//! root in the registry, persists the undo logs of in-flight transactions
//! into the transaction table, rotates the redo stream, and closes the
//! copy-on-write generation. The latch is then released; writers continue
//! while the closed generation's dirty nodes flush. After the page sync,
//! the new header is written to the alternate slot and synced; only that
//! final sync flips the database to the new root. Deferred page frees and
//! superseded redo files are reclaimed afterwards.

use boreal_common::error::{BorealError, Result};
use boreal_common::types::{PageId, TxnId};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

use crate::db::DbInner;
use crate::header::DbHeader;
use crate::pagearray::PageArray;
use crate::store::PageStore;

const TABLE_HEADER: usize = 16;

/// Writes the in-flight transaction table as a page chain, returning its
/// root. Entries are (txn id, undo chain head) pairs.
pub(crate) fn write_txn_table(
    store: &PageStore,
    entries: &[(TxnId, PageId)],
) -> Result<PageId> {
    if entries.is_empty() {
        return Ok(PageId::NONE);
    }
    let per_page = (store.page_size - TABLE_HEADER) / 16;
    let mut root = PageId::NONE;
    let mut buf = vec![0u8; store.page_size];
    for chunk in entries.chunks(per_page).rev() {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0..8].copy_from_slice(&root.0.to_le_bytes());
        buf[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        for (i, (txn, undo)) in chunk.iter().enumerate() {
            let at = TABLE_HEADER + i * 16;
            buf[at..at + 8].copy_from_slice(&txn.0.to_le_bytes());
            buf[at + 8..at + 16].copy_from_slice(&undo.0.to_le_bytes());
        }
        let id = store.allocator.alloc();
        store.write_raw(id, &buf)?;
        root = id;
    }
    Ok(root)
}

/// Reads the transaction table. Returns the entries and the chain pages,
/// which the caller frees once the table has been consumed.
pub(crate) fn read_txn_table(
    store: &PageStore,
    root: PageId,
) -> Result<(Vec<(TxnId, PageId)>, Vec<PageId>)> {
    let mut entries = Vec::new();
    let mut pages = Vec::new();
    let mut next = root;
    let mut buf = vec![0u8; store.page_size];
    while next.is_some() {
        store.read_raw(next, &mut buf)?;
        pages.push(next);
        let count = u32::from_le_bytes(buf[8..12].try_into().expect("len")) as usize;
        let per_page = (store.page_size - TABLE_HEADER) / 16;
        if count > per_page {
            return Err(BorealError::PageCorrupted {
                page_id: next.0,
                reason: "transaction table count out of range".to_string(),
            });
        }
        for i in 0..count {
            let at = TABLE_HEADER + i * 16;
            let txn = TxnId(u64::from_le_bytes(buf[at..at + 8].try_into().expect("len")));
            let undo =
                PageId(u64::from_le_bytes(buf[at + 8..at + 16].try_into().expect("len")));
            entries.push((txn, undo));
        }
        next = PageId(u64::from_le_bytes(buf[0..8].try_into().expect("len")));
    }
    Ok((entries, pages))
}

/// Runs one checkpoint. A no-op for in-memory databases.
pub(crate) fn checkpoint(db: &DbInner) -> Result<()> {
    if db.config.base_file.is_none() {
        return Ok(());
    }
    let _serial = db.checkpoint_mutex.lock();
    db.check_open()?;

    let store = &db.store;
    let (closed_gen, p0, file_num, registry_root, txn_table_root) = {
        let _x = db.commit_latch.exclusive();

        // Record every open tree's current root in the registry, so the
        // captured registry resolves them after a restart.
        let trees: Vec<_> = db.open_trees.lock().values().cloned().collect();
        for tree in &trees {
            db.update_registry_root(tree)?;
        }
        db.update_registry_root(&db.trash.tree)?;

        // Persist in-flight transactions' undo logs.
        let active: Vec<_> = {
            let map = db.active_txns.lock();
            map.iter().map(|(id, undo)| (TxnId(*id), undo.clone())).collect()
        };
        let mut table = Vec::new();
        for (txn_id, undo) in active {
            let mut undo = undo.lock();
            if undo.is_empty() {
                continue;
            }
            let head = undo.persist(store)?;
            table.push((txn_id, head));
        }
        let txn_table_root = write_txn_table(store, &table)?;

        // Rotate the redo stream; everything below the new base position
        // is captured by this checkpoint.
        let file_num = db.redo.file_num() + 1;
        let path = db
            .config
            .redo_file(file_num)
            .ok_or_else(|| BorealError::Internal("durable database without redo path".into()))?;
        let p0 = db.redo.rotate(path, file_num)?;

        let closed_gen = store.bump_gen();
        (closed_gen, p0, file_num, db.registry.root_id(), txn_table_root)
    };

    // Writers proceed; flush what the closed generation dirtied.
    let flushed = store.cache.flush_dirty(&*store.pages, closed_gen)?;
    debug!(flushed, closed_gen, "checkpoint flushed dirty nodes");

    let allocator_root = match store.allocator.commit(&*store.pages) {
        Ok(root) => root,
        Err(e) => {
            store.allocator.abort_commit();
            db.panic(format!("allocator commit failed: {}", e));
            return Err(e);
        }
    };

    let page_count = store
        .allocator
        .logical_page_count()
        .max(store.pages.page_count());
    if store.pages.page_count() < page_count {
        store.pages.set_page_count(page_count)?;
    }
    store.pages.sync(true)?;

    let mut meta = db.header_meta.lock();
    let header = DbHeader {
        page_size: store.page_size,
        counter: meta.counter + 1,
        registry_root,
        allocator_root,
        txn_table_page: txn_table_root,
        page_count,
        redo_file_num: file_num,
        redo_position: p0,
        highest_txn_id: TxnId(db.next_txn_id.load(Ordering::Acquire).saturating_sub(1)),
    };
    if let Err(e) = header.write(&*store.pages) {
        db.panic(format!("header write failed: {}", e));
        return Err(e);
    }
    meta.counter = header.counter;

    // The new root is durable; the old generation's pages may be reused
    // and superseded redo files deleted.
    store.allocator.finish_checkpoint();
    for n in meta.oldest_redo_file..file_num {
        if let Some(path) = db.config.redo_file(n) {
            let _ = std::fs::remove_file(path);
        }
    }
    meta.oldest_redo_file = file_num;

    info!(
        counter = header.counter,
        redo_position = p0,
        page_count,
        "checkpoint complete"
    );
    Ok(())
}
