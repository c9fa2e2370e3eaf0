//! The sync path: per-TXG traversal that pushes dirty records into the
//! I/O pipeline.
//!
//! Leaves write their record's buffer; indirects build their own write
//! first (so each child's completion can publish into the parent's
//! payload) and then drive their child list; the bonus region is copied
//! straight into the descriptor with no I/O.  A leaf whose resolving read
//! is still outstanding gets its write built but parked on the record
//! until the resolve completes.

use crate::dirty::{DirtyRecord, OverrideState};
use crate::dnode::{Dnode, Topology, Tx};
use crate::range::RangeList;
use crate::state::DbufState;
use crate::{
    BlkptrSlot, Dbuf, EvictionList, Guard, hold_impl, rele_and_unlock, syncer_split,
    transition_to_read, verify, write_slot_blkptr,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tephra_store::{Io, WriteIo, WritePayload};
use tephra_types::{BLKPTR_SIZE, BlockId, BlockPtr, TxgId};
use tracing::{trace, warn};

impl Dnode {
    /// Flush every dirty dbuf of `tx`'s TXG through the I/O pipeline.
    ///
    /// Returns the TXG's root io; the caller (the pool's syncing context)
    /// waits on it before opening the next sync.  Writes for one TXG
    /// complete before the next TXG's sync begins, which is what keeps
    /// `data_pending` a single slot per dbuf.
    pub fn sync(self: &Arc<Self>, tx: &Tx) -> Io {
        assert!(tx.is_syncing(), "sync requires a syncing-context handle");
        let topo = *self.topology.read();
        let root = Io::root(self.env().store().executor());
        let list = self.take_dirty(tx.txg());
        trace!(
            target: "tephra::dbuf",
            event = "sync_begin",
            object = self.object().0,
            txg = tx.txg().0,
            dirty = list.len()
        );
        sync_list(self, list, tx, topo, &root);
        self.clear_freed_txg(tx.txg());
        root.dispatch();
        root
    }
}

pub(crate) fn sync_list(dn: &Arc<Dnode>, list: Vec<Arc<Dbuf>>, tx: &Tx, topo: Topology, pio: &Io) {
    for db in list {
        if db.level().is_leaf() {
            sync_leaf(dn, &db, tx, topo, pio);
        } else {
            sync_indirect(dn, &db, tx, topo, pio);
        }
    }
}

fn sync_leaf(dn: &Arc<Dnode>, db: &Arc<Dbuf>, tx: &Tx, topo: Topology, pio: &Io) {
    let txg = tx.txg();
    let mut g = db.mtx.lock();

    if g.state.contains(DbufState::PARTIAL) {
        // Time has run out waiting for a writer to finish this buffer;
        // start the resolving read now.
        debug_assert!(
            g.oldest_dirty()
                .and_then(DirtyRecord::leaf_data)
                .is_some_and(|buf| !buf.is_frozen())
        );
        g = transition_to_read(db, false, g);
    }

    // To be synced we must be dirty, but a free may have raced the dirty.
    if g.state == DbufState::UNCACHED {
        debug_assert!(g.data.is_none());
    } else if g.state.contains(DbufState::FILL) {
        // A newer TXG's writer owns the frontend; it must not be the
        // buffer this record is about to write.
        debug_assert!(
            g.data
                .clone()
                .zip(g.dirty_index_for(txg).and_then(|i| g.dirty_records[i].leaf_data()))
                .is_none_or(|(front, dr_data)| !tephra_store::CacheBuf::same_buf(&front, &dr_data))
        );
    } else {
        debug_assert!(g.state.intersects(
            DbufState::CACHED
                .with(DbufState::READ)
                .with(DbufState::NOFILL)
        ));
    }
    verify(db, &g);

    if db.blkid().is_spill() {
        dn.phys.lock().have_spill = true;
    }

    if db.blkid().is_bonus() {
        sync_bonus(dn, db, g, txg);
        return;
    }

    g = ensure_blkptr(dn, db, topo, g);

    // An immediate write may be mid-flight; wait for it to pre-commit.
    loop {
        let Some(idx) = g.dirty_index_for(txg) else {
            panic!("sync of a TXG with no dirty record");
        };
        if g.dirty_records[idx].override_state() != OverrideState::InSync {
            break;
        }
        debug_assert!(!dn.is_meta());
        db.changed.wait(&mut g);
    }

    let idx = g.dirty_index_for(txg).expect("record exists");
    let resolve_pending = g.dirty_records[idx]
        .leaf_ranges()
        .is_some_and(|ranges| !ranges.is_empty());

    // Splits must wait until the buffer contents are fully valid.
    if !resolve_pending && !dn.is_meta() {
        syncer_split(db, &mut g, false);
    }

    // Announce that this record is on its way to disk.
    g.data_pending = Some(txg);
    debug_assert_eq!(g.oldest_dirty().expect("record exists").txg, txg);

    let idx = g.dirty_index_for(txg).expect("record exists");
    let dr_data = g.dirty_records[idx].leaf_data();
    let nofill = g.state.contains(DbufState::NOFILL);
    let override_bp = match g.dirty_records[idx].override_state() {
        OverrideState::Overridden => {
            let leaf = g.dirty_records[idx].leaf().expect("leaf record");
            Some((leaf.overridden_by.expect("override carries a pointer"), leaf.nopwrite))
        }
        _ => None,
    };
    drop(g);

    let payload = match (&override_bp, nofill, dr_data) {
        (Some(_), _, _) | (None, true, _) | (None, false, None) => WritePayload::NoData,
        (None, false, Some(buf)) => WritePayload::Data(buf),
    };
    let wio = build_write(dn, db, txg, payload, override_bp, pio);
    let pending = wio.io().clone();

    // Re-check under the mutex: the resolve may have completed while the
    // write was being built.
    let mut g = db.mtx.lock();
    let idx = g.dirty_index_for(txg).expect("record exists");
    g.dirty_records[idx].pending_io = Some(pending);
    if resolve_pending {
        let still_pending = g.dirty_records[idx]
            .leaf_ranges()
            .is_some_and(|ranges| !ranges.is_empty());
        if still_pending {
            // Park the write; read completion dispatches it.
            debug_assert!(g.dirty_records[idx].write_io.is_none());
            g.dirty_records[idx].write_io = Some(wio);
            db.env()
                .counters
                .deferred_resolves
                .fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "tephra::dbuf",
                event = "sync_deferred",
                key = %db.key(),
                txg = txg.0
            );
            return;
        }
    }
    drop(g);
    wio.dispatch();
}

fn sync_indirect(dn: &Arc<Dnode>, db: &Arc<Dbuf>, tx: &Tx, topo: Topology, pio: &Io) {
    let txg = tx.txg();
    let mut g = db.mtx.lock();
    assert!(!db.level().is_leaf());

    // Read the payload in if it is not resident yet.
    if g.data.is_none() {
        drop(g);
        db.read(None, crate::ReadFlags::default())
            .expect("indirect payload must be readable to sync");
        g = db.mtx.lock();
    }
    assert_eq!(g.state, DbufState::CACHED);
    assert!(g.data.is_some());
    debug_assert_eq!(g.block_size, 1_usize << topo.indblkshift);

    g = ensure_blkptr(dn, db, topo, g);

    // The payload will be modified by child completions while the write
    // is in the pipeline; detach it from any resident identity.
    let payload_buf = g.data.clone().expect("read above");
    db.env().store().release(&payload_buf);

    g.data_pending = Some(txg);
    debug_assert_eq!(g.oldest_dirty().expect("record exists").txg, txg);
    let idx = g.dirty_index_for(txg).expect("record on the dirty list");
    let children = Arc::clone(
        g.dirty_records[idx]
            .children()
            .expect("indirect record"),
    );
    drop(g);

    // Build the indirect's write first so each child pipelines beneath it
    // and can publish into the payload before it is serialized.
    let wio = build_write(dn, db, txg, WritePayload::Data(payload_buf), None, pio);
    {
        let mut g = db.mtx.lock();
        let idx = g.dirty_index_for(txg).expect("record exists");
        g.dirty_records[idx].pending_io = Some(wio.io().clone());
    }

    let kids = {
        let mut kids = children.lock();
        std::mem::take(&mut *kids)
    };
    sync_list(dn, kids, tx, topo, pio);
    debug_assert!(children.lock().is_empty());

    wio.dispatch();
}

/// Copy the bonus bytes into the descriptor; no I/O is issued for the
/// bonus region.  Consumes the guard.
fn sync_bonus(dn: &Arc<Dnode>, db: &Arc<Dbuf>, mut g: Guard<'_>, txg: TxgId) {
    let idx = g.dirty_index_for(txg).expect("bonus record exists");
    debug_assert_eq!(idx, g.dirty_records.len() - 1, "bonus record must be oldest");
    let dr = g.dirty_records.remove(idx);
    let data = dr.leaf_data().expect("bonus record carries data");
    drop(dr);

    {
        let mut phys = dn.phys.lock();
        let n = phys.bonus.len();
        data.with_data(|bytes| phys.bonus.copy_from_slice(&bytes[..n]));
    }
    trace!(target: "tephra::dbuf", event = "sync_bonus", key = %db.key(), txg = txg.0);

    g.data_pending = None;
    db.changed.notify_all();
    let mut evictions = EvictionList::new();
    rele_and_unlock(db, g, "txg", &mut evictions);
}

/// Make sure the dbuf knows where its block pointer lives before the
/// write publishes into it.  May drop and retake the mutex to resolve the
/// parent indirect.
fn ensure_blkptr<'a>(dn: &Arc<Dnode>, db: &'a Arc<Dbuf>, topo: Topology, g: Guard<'a>) -> Guard<'a> {
    if !g.blkptr.is_none() {
        return g;
    }
    let blkid = db.blkid();
    let level = db.level();

    if blkid.is_spill() {
        let mut g = g;
        let mut phys = dn.phys.lock();
        if phys.spill.is_none() {
            phys.spill = Some(BlockPtr::hole());
        }
        drop(phys);
        g.blkptr = BlkptrSlot::Spill;
        return g;
    }

    if level.0 == topo.nlevels - 1 {
        // Allocated before the descriptor had a pointer slot for it.
        assert!((blkid.0 as usize) < topo.nblkptr);
        let mut g = g;
        debug_assert!(g.parent.is_none());
        g.blkptr = BlkptrSlot::Dnode {
            slot: blkid.0 as usize,
        };
        verify(db, &g);
        return g;
    }

    // Interior block: the slot lives in the parent indirect's payload.
    let parent = g.parent.clone();
    drop(g);
    let (parent, fresh_hold) = match parent {
        Some(parent) => (parent, false),
        None => {
            let topo_guard = dn.topology.read();
            let parent = hold_impl(
                dn,
                &topo_guard,
                level.up(),
                BlockId(blkid.0 >> topo.epbs()),
                false,
                "child",
            )
            .expect("parent indirect resolves in syncing context");
            (parent, true)
        }
    };
    parent
        .read(None, crate::ReadFlags::default())
        .expect("parent indirect must be readable");
    let pbuf = parent
        .mtx
        .lock()
        .data
        .clone()
        .expect("parent cached after read");

    let mut g = db.mtx.lock();
    if fresh_hold {
        // The fresh hold becomes the child's parent reference, released
        // when the child is destroyed.
        g.parent = Some(Arc::clone(&parent));
    }
    let index = (blkid.0 & ((1_u64 << topo.epbs()) - 1)) as usize;
    g.blkptr = BlkptrSlot::Indirect {
        parent,
        buf: pbuf,
        index,
    };
    verify(db, &g);
    g
}

/// Build (but do not dispatch) the write for one dirty record.
///
/// The write pipelines beneath the parent indirect's pending write when
/// one exists, so a child's completion is always upstream of its parent's;
/// top-level blocks pipeline beneath the TXG root io.
fn build_write(
    dn: &Arc<Dnode>,
    db: &Arc<Dbuf>,
    txg: TxgId,
    payload: WritePayload,
    override_bp: Option<(BlockPtr, bool)>,
    pio: &Io,
) -> WriteIo {
    let parent_io = {
        let parent = db.mtx.lock().parent.clone();
        match parent {
            Some(parent) => {
                let pg = parent.mtx.lock();
                let pending = pg
                    .data_pending
                    .and_then(|ptxg| pg.dirty_index_for(ptxg))
                    .and_then(|idx| pg.dirty_records[idx].pending_io.clone());
                pending.unwrap_or_else(|| pio.clone())
            }
            None => pio.clone(),
        }
    };

    let (obp, nopwrite) = match override_bp {
        Some((bp, nop)) => (Some(bp), nop),
        None => (None, false),
    };

    let ready_db = Arc::clone(db);
    let ready_dn = Arc::clone(dn);
    let done_db = Arc::clone(db);
    let old_bp = {
        let g = db.mtx.lock();
        db.read_blkptr_locked(&g, dn)
    };

    db.env().store().write(
        Some(&parent_io),
        txg,
        payload,
        obp,
        nopwrite,
        Box::new(move |bp| write_ready(&ready_db, &ready_dn, old_bp, bp)),
        Box::new(move |result| write_done(&done_db, txg, result)),
    )
}

/// Publication callback: runs when the write's pointer is computed, before
/// the payload is persisted.  Fills in the fill count and stores the
/// pointer into the parent slot.
fn write_ready(db: &Arc<Dbuf>, dn: &Arc<Dnode>, old_bp: Option<BlockPtr>, bp: &mut BlockPtr) {
    let g = db.mtx.lock();

    bp.fill = if bp.is_hole() {
        0
    } else if db.level().is_leaf() {
        1
    } else {
        // Children have already published into the payload: sum them.
        g.data.as_ref().map_or(0, |buf| {
            buf.with_data(|data| {
                data.chunks_exact(BLKPTR_SIZE)
                    .map(|chunk| {
                        BlockPtr::read_from(chunk)
                            .ok()
                            .filter(|child| !child.is_hole())
                            .map_or(0, |child| child.fill)
                    })
                    .sum()
            })
        })
    };

    write_slot_blkptr(&g.blkptr, dn, bp);
    drop(g);

    // Space accounting: new physical size minus old.
    let old_size = old_bp.filter(|bp| !bp.is_hole()).map_or(0, |bp| i64::from(bp.lsize));
    let new_size = if bp.is_hole() { 0 } else { i64::from(bp.lsize) };
    dn.willuse_space(new_size - old_size);
    trace!(
        target: "tephra::dbuf",
        event = "write_ready",
        key = %db.key(),
        addr = bp.addr.0,
        fill = bp.fill
    );
}

/// Completion callback: retire the dirty record and drop the TXG hold.
fn write_done(db: &Arc<Dbuf>, txg: TxgId, result: tephra_error::Result<BlockPtr>) {
    if let Err(err) = &result {
        // The failure propagates to the TXG root through the pipeline; the
        // record is still retired so the dbuf does not wedge.
        warn!(
            target: "tephra::dbuf",
            event = "write_failed",
            key = %db.key(),
            txg = txg.0,
            error = %err
        );
    }
    let mut evictions = EvictionList::new();
    let mut g = db.mtx.lock();
    undirty_write(db, &mut g, txg);
    db.changed.notify_all();
    rele_and_unlock(db, g, "txg", &mut evictions);
}

/// Remove a written-out record.
fn undirty_write(db: &Arc<Dbuf>, g: &mut Guard<'_>, txg: TxgId) {
    let idx = g.dirty_index_for(txg).expect("written record exists");
    // There are no older records beneath the one being written.
    debug_assert_eq!(idx, g.dirty_records.len() - 1);
    let mut dr = g.dirty_records.remove(idx);
    debug_assert!(
        dr.leaf_ranges().is_none_or(RangeList::is_empty),
        "write completed with unresolved ranges"
    );
    if let Some(children) = dr.children() {
        debug_assert!(children.lock().is_empty());
    }
    dr.parent_children = None;
    drop(dr);
    g.data_pending = None;
    trace!(
        target: "tephra::dbuf",
        event = "undirty_write",
        key = %db.key(),
        txg = txg.0,
        remaining = g.dirty_count()
    );
}
