//! The dirty path: recording an intent to modify a block.
//!
//! Every dirty call follows the same discipline:
//!
//! 1. enter (take the dbuf mutex, capture the dnode)
//! 2. pre-dirty COW-fault handling (leaf only; may drop the mutex)
//! 3. compute state (wait out a foreign filler, find the insertion point)
//! 4. state update
//! 5. frontend reconciliation (allocate, fork, or install)
//! 6. create or update this TXG's dirty record
//! 7. exit (drop the mutex, dirty the parent, drain user evictions)

use crate::dnode::{Dnode, Topology, Tx};
use crate::range::RangeList;
use crate::state::DbufState;
use crate::{
    Dbuf, EvictionList, Guard, add_ref, alloc_frontend, clear_and_destroy, clear_data, hold_impl,
    merge_state, read_complete, rele, run_waiters, set_data, set_state, take_waiters,
    transition_to_read, verify,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tephra_error::Result;
use tephra_store::{CacheBuf, Io, WriteIo};
use tephra_types::{BlockId, BlockPtr, TXG_CONCURRENT_STATES, TxgId};
use tracing::trace;

/// Children of an indirect's dirty record, guarded by the record's own
/// mutex (taken before any child dbuf mutex).
pub(crate) type ChildList = Arc<Mutex<Vec<Arc<Dbuf>>>>;

/// State of an immediate (pre-committed) write against a dirty record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OverrideState {
    None,
    /// An immediate write is in flight; the syncer must wait.
    InSync,
    /// The block pointer was pre-committed out of band.
    Overridden,
}

pub(crate) struct DirtyLeaf {
    /// Buffer carrying this TXG's write content; `None` for NOFILL.
    pub(crate) data: Option<CacheBuf>,
    /// Byte intervals of `data` written by the client.
    pub(crate) ranges: RangeList,
    pub(crate) override_state: OverrideState,
    pub(crate) overridden_by: Option<BlockPtr>,
    pub(crate) nopwrite: bool,
    /// Immediate-write I/O parked until a pending resolve completes.
    pub(crate) override_io: Option<WriteIo>,
}

pub(crate) struct DirtyIndirect {
    pub(crate) children: ChildList,
}

pub(crate) enum DirtyDetail {
    Leaf(DirtyLeaf),
    Indirect(DirtyIndirect),
}

/// One TXG's worth of pending modification to a dbuf.
pub(crate) struct DirtyRecord {
    pub(crate) txg: TxgId,
    /// Syncer write parked until a pending resolve completes.
    pub(crate) write_io: Option<WriteIo>,
    /// Live pipeline node of this record's write, for pipelining children.
    pub(crate) pending_io: Option<Io>,
    /// The parent record's child list this record is linked into.
    pub(crate) parent_children: Option<ChildList>,
    pub(crate) detail: DirtyDetail,
}

impl DirtyRecord {
    pub(crate) fn new_leaf(txg: TxgId, data: Option<CacheBuf>) -> Self {
        Self {
            txg,
            write_io: None,
            pending_io: None,
            parent_children: None,
            detail: DirtyDetail::Leaf(DirtyLeaf {
                data,
                ranges: RangeList::new(),
                override_state: OverrideState::None,
                overridden_by: None,
                nopwrite: false,
                override_io: None,
            }),
        }
    }

    pub(crate) fn new_indirect(txg: TxgId) -> Self {
        Self {
            txg,
            write_io: None,
            pending_io: None,
            parent_children: None,
            detail: DirtyDetail::Indirect(DirtyIndirect {
                children: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    pub(crate) fn leaf(&self) -> Option<&DirtyLeaf> {
        match &self.detail {
            DirtyDetail::Leaf(leaf) => Some(leaf),
            DirtyDetail::Indirect(_) => None,
        }
    }

    pub(crate) fn leaf_mut(&mut self) -> Option<&mut DirtyLeaf> {
        match &mut self.detail {
            DirtyDetail::Leaf(leaf) => Some(leaf),
            DirtyDetail::Indirect(_) => None,
        }
    }

    pub(crate) fn leaf_data(&self) -> Option<CacheBuf> {
        self.leaf().and_then(|leaf| leaf.data.clone())
    }

    pub(crate) fn set_leaf_data(&mut self, buf: CacheBuf) {
        self.leaf_mut().expect("leaf record").data = Some(buf);
    }

    pub(crate) fn leaf_ranges(&self) -> Option<&RangeList> {
        self.leaf().map(|leaf| &leaf.ranges)
    }

    pub(crate) fn clear_leaf_ranges(&mut self) -> usize {
        self.leaf_mut().map_or(0, |leaf| leaf.ranges.clear())
    }

    pub(crate) fn children(&self) -> Option<&ChildList> {
        match &self.detail {
            DirtyDetail::Indirect(ind) => Some(&ind.children),
            DirtyDetail::Leaf(_) => None,
        }
    }

    pub(crate) fn override_state(&self) -> OverrideState {
        self.leaf().map_or(OverrideState::None, |l| l.override_state)
    }

    pub(crate) fn take_override_io(&mut self) -> Option<WriteIo> {
        self.leaf_mut().and_then(|leaf| leaf.override_io.take())
    }
}

fn note_range_delta(db: &Dbuf, before: usize, after: usize) {
    let env = db.env();
    let delta = after as i64 - before as i64;
    env.counters_ranges_in_flight(delta);
    if delta > 0 {
        env.counters_ranges_total(delta as u64);
    }
}

/// Reset any immediate-write state on a record that is about to be
/// re-dirtied: the pre-committed pointer no longer describes the content.
pub(crate) fn unoverride(db: &Dbuf, dr: &mut DirtyRecord) {
    let Some(leaf) = dr.leaf_mut() else {
        return;
    };
    if db.blkid().is_bonus() || leaf.override_state == OverrideState::None {
        return;
    }
    assert!(
        leaf.override_state != OverrideState::InSync,
        "cannot re-dirty during an immediate write"
    );
    trace!(
        target: "tephra::dbuf",
        event = "unoverride",
        key = %db.key(),
        nopwrite = leaf.nopwrite
    );
    leaf.override_state = OverrideState::None;
    leaf.overridden_by = None;
    leaf.nopwrite = false;
    // Leave the already-written buffer modifiable; every caller is about
    // to write it again anyway.
    if let Some(data) = &leaf.data {
        db.env().store().release(data);
    }
}

impl Dbuf {
    /// Mark `tx`'s record as carrying an in-flight immediate write; the
    /// sync path waits for [`Dbuf::override_done`].
    pub fn override_begin(&self, tx: &Tx) {
        let mut g = self.mtx.lock();
        let idx = g
            .dirty_index_for(tx.txg())
            .expect("immediate write requires a dirty record");
        let leaf = g.dirty_records[idx].leaf_mut().expect("leaf record");
        assert_eq!(leaf.override_state, OverrideState::None);
        leaf.override_state = OverrideState::InSync;
    }

    /// Complete an immediate write: `bp` is the pre-committed pointer the
    /// sync path will reuse.
    pub fn override_done(&self, tx: &Tx, bp: BlockPtr, nopwrite: bool) {
        let mut g = self.mtx.lock();
        let idx = g
            .dirty_index_for(tx.txg())
            .expect("immediate write requires a dirty record");
        let leaf = g.dirty_records[idx].leaf_mut().expect("leaf record");
        assert_eq!(leaf.override_state, OverrideState::InSync);
        leaf.override_state = OverrideState::Overridden;
        leaf.overridden_by = Some(bp);
        leaf.nopwrite = nopwrite;
        drop(g);
        self.changed.notify_all();
    }
}

// --- the dirty state machine ---------------------------------------------

struct DirtyCx {
    tx: Tx,
    offset: usize,
    size: usize,
    fill_buf: Option<CacheBuf>,
    txg_already_dirty: bool,
    insert_at: usize,
    do_free_accounting: bool,
    freeable_size: i64,
}

fn dirty_verify(db: &Dbuf, g: &Guard<'_>, dn: &Dnode, tx: &Tx) {
    assert!(tx.txg().0 != 0);
    assert!(g.holds > 0, "dirtying an unheld dbuf");
    let newest = g.newest_dirty().map(|dr| dr.txg);
    assert!(
        newest.is_none_or(|t| t <= tx.txg()) || dn.is_meta(),
        "only the meta object may dirty an older TXG"
    );
    // A regular buffer must not first become dirty in syncing context.
    assert!(!tx.is_syncing() || dn.is_meta() || g.dirty_index_for(tx.txg()).is_some());
}

/// Steps 3 of the discipline: wait for any foreign filler and locate the
/// insertion point (newest-first, strictly decreasing TXG).
fn compute_state(db: &Arc<Dbuf>, g: &mut Guard<'_>, dn: &Dnode, cx: &mut DirtyCx) {
    while g.state.contains(DbufState::FILL) {
        debug_assert!(db.level().is_leaf());
        db.changed.wait(g);
    }
    dirty_verify(db, g, dn, &cx.tx);
    if db.blkid().is_spill() {
        dn.phys.lock().have_spill = true;
    }

    cx.insert_at = g
        .dirty_records
        .iter()
        .position(|dr| dr.txg <= cx.tx.txg())
        .unwrap_or(g.dirty_records.len());
    cx.txg_already_dirty = g
        .dirty_records
        .get(cx.insert_at)
        .is_some_and(|dr| dr.txg == cx.tx.txg());
}

/// Accounting recorded once per new dirty record.
fn new_record_accounting(db: &Dbuf, g: &Guard<'_>, dn: &Dnode, cx: &mut DirtyCx) {
    assert!(g.block_size != 0);
    if db.blkid().is_bonus() {
        return;
    }
    dn.willuse_space(g.block_size as i64);
    if !db.blkid().is_spill() {
        // The pre-existing block will be freed by this rewrite; the size is
        // only a guess until the pointer is stable.
        let bp = db.read_blkptr_locked(g, dn);
        if let Some(bp) = bp
            && !bp.is_hole()
        {
            cx.do_free_accounting = true;
            cx.freeable_size = i64::from(bp.lsize);
        }
    }
}

fn register_record(db: &Dbuf, g: &mut Guard<'_>, cx: &DirtyCx, dr: DirtyRecord) {
    g.dirty_records.insert(cx.insert_at, dr);
    // The record holds the dbuf on behalf of its TXG.
    g.holds += 1;
    assert!(g.dirty_count() <= TXG_CONCURRENT_STATES);
    trace!(
        target: "tephra::dbuf",
        event = "dirty",
        key = %db.key(),
        txg = cx.tx.txg().0,
        dirty_count = g.dirty_count()
    );
}

fn create_leaf_record(db: &Dbuf, g: &mut Guard<'_>, dn: &Dnode, cx: &mut DirtyCx) {
    new_record_accounting(db, g, dn, cx);
    // If this block was marked freed in this TXG, revert that.
    if !db.blkid().is_spill() && !db.blkid().is_bonus() {
        dn.clear_freed(db.blkid(), cx.tx.txg());
        g.freed_in_flight = false;
    }
    let data = g.data.clone();
    let dr = DirtyRecord::new_leaf(cx.tx.txg(), data);
    register_record(db, g, cx, dr);
}

fn create_nofill_record(db: &Dbuf, g: &mut Guard<'_>, dn: &Dnode, cx: &mut DirtyCx) {
    new_record_accounting(db, g, dn, cx);
    let dr = DirtyRecord::new_leaf(cx.tx.txg(), None);
    register_record(db, g, cx, dr);
}

fn create_indirect_record(db: &Dbuf, g: &mut Guard<'_>, dn: &Dnode, cx: &mut DirtyCx) {
    new_record_accounting(db, g, dn, cx);
    let dr = DirtyRecord::new_indirect(cx.tx.txg());
    register_record(db, g, cx, dr);
}

/// Step 2: decide whether to start a resolving read now, before the dirty
/// record exists, to avoid a copy-on-write fault later.
fn handle_fault<'a>(
    db: &'a Arc<Dbuf>,
    dn: &Dnode,
    cx: &DirtyCx,
    have_struct: bool,
    mut g: Guard<'a>,
) -> Guard<'a> {
    debug_assert!(db.level().is_leaf());
    if g.state.contains(DbufState::PARTIAL) {
        let head_txg = g.newest_dirty().map(|dr| dr.txg);
        if head_txg.is_some_and(|t| t != cx.tx.txg()) {
            // The newest record's TXG has closed; fault resolution cannot
            // be avoided, so start it asynchronously now.
            g = transition_to_read(db, have_struct, g);
        }
    } else if g.state == DbufState::UNCACHED {
        let write_end = cx.offset + cx.size;
        if cx.offset != 0 && write_end != g.block_size {
            // An interior write: future writes are unlikely to fill the
            // block, so begin resolving immediately.
            g = transition_to_read(db, have_struct, g);
        } else if cx.size != g.block_size {
            // A prefix or suffix write.  If a previous version is resident
            // in the backing cache, take it and skip the partial-buffer
            // bookkeeping entirely.
            let bp = db.read_blkptr_locked(&g, dn);
            if let Some(bp) = bp
                && !bp.is_hole()
                && let Some(buf) = db.env().store().read_cached(&bp)
            {
                merge_state(db, &mut g, DbufState::READ, "cache probe hit");
                read_complete(db, &mut g, buf, false);
            }
        }
    }
    g
}

/// Step 5 when a frontend already exists: make it writable for this TXG
/// without disturbing content owned by older records or the syncer.
fn reconcile_existing_frontend(db: &Arc<Dbuf>, g: &mut Guard<'_>, cx: &mut DirtyCx) {
    let store = db.env().store().clone();
    let frontend = g.data.clone().expect("caller checked");
    debug_assert!(
        cx.fill_buf
            .as_ref()
            .is_none_or(|fb| !CacheBuf::same_buf(fb, &frontend))
    );
    assert!(
        g.holds > g.dirty_count() as u64,
        "dirtying requires a non-TXG hold"
    );

    if cx.txg_already_dirty {
        let idx = cx.insert_at;
        unoverride(db, &mut g.dirty_records[idx]);
    }

    let newest_aliases_frontend = !cx.txg_already_dirty
        && g
            .newest_dirty()
            .and_then(DirtyRecord::leaf_data)
            .is_some_and(|data| CacheBuf::same_buf(&data, &frontend));

    if newest_aliases_frontend {
        let newest_txg = g.newest_dirty().expect("alias implies record").txg;
        if g.data_pending == Some(newest_txg) {
            // The syncer scheduled its write against this buffer and is
            // waiting on a deferred resolve; disassociate by replacing the
            // live frontend instead.
            assert!(
                g.state
                    .intersects(DbufState::READ.with(DbufState::PARTIAL))
            );
            assert_eq!(g.dirty_count(), 1);
            let buf = cx
                .fill_buf
                .take()
                .unwrap_or_else(|| alloc_frontend(db, g.block_size));
            set_data(db, g, buf);
        } else {
            // Common case: give the older TXG's record a private copy.
            let copy = alloc_frontend(db, g.block_size);
            copy.copy_from(&frontend);
            g.dirty_records[0].set_leaf_data(copy);
            store.release(&frontend);
            if let Some(fill) = cx.fill_buf.take() {
                frontend.copy_from(&fill);
            }
        }
        return;
    }

    if let Some(fill) = cx.fill_buf.take() {
        // Full-block content supplied and the frontend is ours.
        store.release(&frontend);
        frontend.copy_from(&fill);
        return;
    }

    // Frontend not owned by anybody else; note that it will be modified.
    if cx.txg_already_dirty {
        debug_assert!(frontend.is_released());
        frontend.thaw();
    } else {
        store.release(&frontend);
    }
}

/// Step 6's range accumulation, plus the PARTIAL→FILL advance when the
/// union covers the block.
fn add_dirty_range(db: &Arc<Dbuf>, g: &mut Guard<'_>, txg: TxgId, offset: usize, size: usize) {
    debug_assert!(db.level().is_leaf());
    let block_size = g.block_size;
    let idx = g.dirty_index_for(txg).expect("record just ensured");
    let (before, after) = {
        let leaf = g.dirty_records[idx].leaf_mut().expect("leaf record");
        let before = leaf.ranges.len();
        leaf.ranges.add(offset, size, block_size);
        (before, leaf.ranges.len())
    };
    note_range_delta(db, before, after);
    trace!(
        target: "tephra::dbuf",
        event = "dirty_range",
        key = %db.key(),
        txg = txg.0,
        offset,
        size,
        ranges = after
    );
    if g.state
        .intersects(DbufState::READ.with(DbufState::PARTIAL))
        && g.dirty_records[idx]
            .leaf_ranges()
            .is_some_and(RangeList::is_empty)
    {
        set_state(db, g, DbufState::FILL, "complete filler");
    }
}

/// Step 7: propagate dirtiness upward.  Bonus, spill, and top-level blocks
/// land on the descriptor's per-TXG list; interior blocks dirty their
/// parent indirect and link into its record's child list.
fn dirty_parent(
    db: &Arc<Dbuf>,
    dn: &Arc<Dnode>,
    tx: &Tx,
    topo: Topology,
    have_struct: bool,
) -> Result<()> {
    let blkid = db.blkid();
    let level = db.level();

    if blkid.is_bonus() || blkid.is_spill() {
        dn.push_dirty(tx.txg(), Arc::clone(db));
        dn.setdirty(tx.txg());
        return Ok(());
    }

    let struct_guard = if have_struct {
        None
    } else {
        Some(dn.topology.read())
    };

    if level.is_leaf() {
        dn.new_blkid(blkid);
    }

    if level.0 + 1 < topo.nlevels {
        // The parent is an indirect block.
        let epbs = topo.epbs();
        let (parent, parent_held) = match db.mtx.lock().parent.clone() {
            Some(parent) => (parent, false),
            None => {
                let parent = hold_impl(
                    dn,
                    &topo,
                    level.up(),
                    BlockId(blkid.0 >> epbs),
                    false,
                    "parent",
                )?;
                (parent, true)
            }
        };
        drop(struct_guard);
        assert_eq!(parent.level().0, level.0 + 1);

        let children = dirty_indirect(&parent, dn, tx, topo, have_struct)?;
        if parent_held {
            rele(&parent, "parent");
        }

        // Link this record into the parent record's child list.  The
        // record mutex is taken before the child dbuf mutex.
        let mut kids = children.lock();
        let mut g = db.mtx.lock();
        // A racing undirty may have removed the record already.
        let ours = g
            .newest_dirty()
            .is_some_and(|dr| dr.txg == tx.txg())
            || dn.is_meta();
        if ours && let Some(idx) = g.dirty_index_for(tx.txg()) {
            debug_assert!(!kids.iter().any(|k| Arc::ptr_eq(k, db)));
            kids.push(Arc::clone(db));
            g.dirty_records[idx].parent_children = Some(Arc::clone(&children));
        }
        drop(g);
        drop(kids);
    } else {
        // The parent is the descriptor itself.
        assert_eq!(level.0 + 1, topo.nlevels);
        assert!((blkid.0 as usize) < topo.nblkptr);
        dn.push_dirty(tx.txg(), Arc::clone(db));
        drop(struct_guard);
    }

    dn.setdirty(tx.txg());
    Ok(())
}

/// Dirty an indirect block.  Indirects are always rewritten whole, so no
/// frontend forking applies; returns the record's child list.
fn dirty_indirect(
    db: &Arc<Dbuf>,
    dn: &Arc<Dnode>,
    tx: &Tx,
    topo: Topology,
    have_struct: bool,
) -> Result<ChildList> {
    let mut cx = DirtyCx {
        tx: *tx,
        offset: 0,
        size: 0,
        fill_buf: None,
        txg_already_dirty: false,
        insert_at: 0,
        do_free_accounting: false,
        freeable_size: 0,
    };
    let evictions = EvictionList::new();
    let mut g = db.mtx.lock();
    compute_state(db, &mut g, dn, &mut cx);
    if !cx.txg_already_dirty {
        create_indirect_record(db, &mut g, dn, &mut cx);
    }
    let idx = g.dirty_index_for(tx.txg()).expect("just ensured");
    let children = Arc::clone(g.dirty_records[idx].children().expect("indirect record"));
    verify(db, &g);
    drop(g);
    drop(evictions);

    if !cx.txg_already_dirty {
        finish_free_accounting(dn, &cx);
        dirty_parent(db, dn, tx, topo, have_struct)?;
    }
    Ok(children)
}

fn finish_free_accounting(dn: &Dnode, cx: &DirtyCx) {
    if cx.do_free_accounting {
        dn.willuse_space(-cx.freeable_size);
    }
}

/// Dirty a leaf data block for `[offset, offset + size)`.
fn dirty_leaf(
    db: &Arc<Dbuf>,
    tx: &Tx,
    offset: usize,
    size: usize,
    fill_buf: Option<CacheBuf>,
    topo: Topology,
    have_struct: bool,
) -> Result<()> {
    assert!(db.level().is_leaf());
    assert!(!db.blkid().is_bonus());
    let dn = db.dnode();
    let prepared = fill_buf.is_some();
    let mut cx = DirtyCx {
        tx: *tx,
        offset,
        size,
        fill_buf,
        txg_already_dirty: false,
        insert_at: 0,
        do_free_accounting: false,
        freeable_size: 0,
    };

    let evictions = EvictionList::new();
    let mut g = db.mtx.lock();
    assert!(offset + size <= g.block_size);

    // COW faults are handled before computing state since the resolving
    // read drops the mutex.
    g = handle_fault(db, &dn, &cx, have_struct, g);
    compute_state(db, &mut g, &dn, &mut cx);

    // Step 4: state update.
    if prepared {
        if g.state != DbufState::CACHED {
            set_state(db, &mut g, DbufState::FILL, "assigning filled buffer");
        }
    } else if g.state == DbufState::UNCACHED {
        set_state(
            db,
            &mut g,
            DbufState::PARTIAL.with(DbufState::FILL),
            "notifying of initial partial fill",
        );
    } else if g
        .state
        .intersects(DbufState::READ.with(DbufState::PARTIAL))
    {
        merge_state(db, &mut g, DbufState::FILL, "notifying of followup partial fill");
    }

    // Step 5: frontend reconciliation.
    if g.data.is_none() {
        let buf = cx
            .fill_buf
            .take()
            .unwrap_or_else(|| alloc_frontend(db, g.block_size));
        set_data(db, &mut g, buf);
    } else {
        reconcile_existing_frontend(db, &mut g, &mut cx);
    }
    debug_assert!(g.data.as_ref().is_some_and(|buf| !buf.is_frozen()));

    // Step 6: create or update the record.
    if cx.txg_already_dirty {
        let front = g.data.clone().expect("frontend ensured");
        g.dirty_records[cx.insert_at].set_leaf_data(front);
    } else {
        create_leaf_record(db, &mut g, &dn, &mut cx);
    }

    if g.state != DbufState::CACHED {
        add_dirty_range(db, &mut g, tx.txg(), offset, size);
    }

    // Step 7: exit.
    debug_assert!(
        g.dirty_records[g.dirty_index_for(tx.txg()).expect("ensured")]
            .leaf_data()
            .zip(g.data.clone())
            .is_none_or(|(a, b)| CacheBuf::same_buf(&a, &b))
    );
    verify(db, &g);
    drop(g);
    drop(evictions);

    if !cx.txg_already_dirty {
        finish_free_accounting(&dn, &cx);
        dirty_parent(db, &dn, tx, topo, have_struct)?;
    }
    Ok(())
}

/// Dirty a buffer of the meta object.  These are rewritten whole in
/// syncing context and may target an older TXG, so no range or frontend
/// forking machinery applies.
fn dirty_meta(db: &Arc<Dbuf>, tx: &Tx, topo: Topology, have_struct: bool) -> Result<()> {
    let dn = db.dnode();
    let mut cx = DirtyCx {
        tx: *tx,
        offset: 0,
        size: 0,
        fill_buf: None,
        txg_already_dirty: false,
        insert_at: 0,
        do_free_accounting: false,
        freeable_size: 0,
    };
    let evictions = EvictionList::new();
    let mut g = db.mtx.lock();
    compute_state(db, &mut g, &dn, &mut cx);
    if g.data.is_none() {
        let buf = alloc_frontend(db, g.block_size);
        set_data(db, &mut g, buf);
    }
    if cx.txg_already_dirty {
        let idx = cx.insert_at;
        unoverride(db, &mut g.dirty_records[idx]);
    } else {
        create_leaf_record(db, &mut g, &dn, &mut cx);
    }
    verify(db, &g);
    drop(g);
    drop(evictions);
    if !cx.txg_already_dirty {
        finish_free_accounting(&dn, &cx);
        dirty_parent(db, &dn, tx, topo, have_struct)?;
    }
    Ok(())
}

/// Dirty the bonus region.  Bonus content never shares buffers across
/// TXGs: a record that still aliases the frontend gets its own copy first.
fn dirty_bonus(db: &Arc<Dbuf>, tx: &Tx) -> Result<()> {
    assert!(db.blkid().is_bonus());
    let dn = db.dnode();
    let mut cx = DirtyCx {
        tx: *tx,
        offset: 0,
        size: 0,
        fill_buf: None,
        txg_already_dirty: false,
        insert_at: 0,
        do_free_accounting: false,
        freeable_size: 0,
    };
    let evictions = EvictionList::new();
    let mut g = db.mtx.lock();
    assert!(
        g.state == DbufState::CACHED,
        "a bonus buffer must be read before it is dirtied"
    );
    compute_state(db, &mut g, &dn, &mut cx);
    if !cx.txg_already_dirty {
        let frontend = g.data.clone().expect("bonus cached");
        let newest_aliases = g
            .newest_dirty()
            .and_then(DirtyRecord::leaf_data)
            .is_some_and(|data| CacheBuf::same_buf(&data, &frontend));
        if newest_aliases {
            let copy = alloc_frontend(db, g.block_size);
            copy.copy_from(&frontend);
            g.dirty_records[0].set_leaf_data(copy);
        }
        create_leaf_record(db, &mut g, &dn, &mut cx);
    }
    verify(db, &g);
    drop(g);
    drop(evictions);
    if !cx.txg_already_dirty {
        // Bonus records hang directly off the descriptor.
        dn.push_dirty(tx.txg(), Arc::clone(db));
        dn.setdirty(tx.txg());
    }
    Ok(())
}

impl Dbuf {
    /// Record an intent to rewrite this whole block in `tx`, reading it in
    /// first if necessary.
    pub fn will_dirty(self: &Arc<Self>, tx: &Tx) -> Result<()> {
        let topo = *self.dnode().topology.read();
        self.will_dirty_impl(tx, topo, false)
    }

    pub(crate) fn will_dirty_impl(
        self: &Arc<Self>,
        tx: &Tx,
        topo: Topology,
        have_struct: bool,
    ) -> Result<()> {
        assert!(tx.txg().0 != 0);
        assert!(self.holds() > 0);
        self.read(
            None,
            crate::ReadFlags {
                have_struct,
                never_wait: false,
            },
        )?;
        // CACHED (or UNCACHED after a failed-sparse hole) at this point.
        if self.blkid().is_bonus() {
            dirty_bonus(self, tx)
        } else if !self.level().is_leaf() {
            dirty_indirect(self, &self.dnode(), tx, topo, have_struct).map(|_| ())
        } else if self.dnode().is_meta() {
            dirty_meta(self, tx, topo, have_struct)
        } else {
            let size = self.block_size();
            dirty_leaf(self, tx, 0, size, None, topo, have_struct)
        }
    }

    /// Record an intent to modify `[offset, offset + size)` of this block
    /// in `tx`.  Partial writes accumulate write ranges; interior writes
    /// start a resolving read early.
    pub fn will_dirty_range(
        self: &Arc<Self>,
        tx: &Tx,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        assert!(tx.txg().0 != 0);
        assert!(self.holds() > 0);
        assert!(self.level().is_leaf());
        assert!(self.blkid().is_ordinary());
        assert!(!self.dnode().is_meta());
        assert!(size > 0);
        let topo = *self.dnode().topology.read();
        dirty_leaf(self, tx, offset, size, None, topo, false)
    }

    /// Announce that the caller will fill the entire block.  Blocks while
    /// another filler owns the frontend.
    pub fn will_fill(self: &Arc<Self>, tx: &Tx) -> Result<()> {
        assert!(!self.blkid().is_bonus());
        assert!(tx.txg().0 != 0);
        assert!(self.level().is_leaf());
        assert!(self.holds() > 0);
        assert!(!self.dnode().is_meta() || tx.is_syncing());
        let topo = *self.dnode().topology.read();
        let size = self.block_size();
        dirty_leaf(self, tx, 0, size, None, topo, false)
    }

    /// Dirty without providing data: the block pointer will be updated but
    /// no user bytes pass through the cache.
    pub fn will_not_fill(self: &Arc<Self>, tx: &Tx) -> Result<()> {
        assert!(self.level().is_leaf());
        assert!(!self.blkid().is_bonus());
        let dn = self.dnode();
        let topo = *dn.topology.read();
        let mut cx = DirtyCx {
            tx: *tx,
            offset: 0,
            size: 0,
            fill_buf: None,
            txg_already_dirty: false,
            insert_at: 0,
            do_free_accounting: false,
            freeable_size: 0,
        };
        let mut evictions = EvictionList::new();
        let mut g = self.mtx.lock();
        assert!(g.state.intersects(
            DbufState::UNCACHED
                .with(DbufState::NOFILL)
                .with(DbufState::CACHED)
        ));
        set_state(self, &mut g, DbufState::NOFILL, "allocating NOFILL buffer");
        clear_data(self, &mut g, &mut evictions);
        compute_state(self, &mut g, &dn, &mut cx);
        if cx.txg_already_dirty {
            let idx = cx.insert_at;
            unoverride(self, &mut g.dirty_records[idx]);
        } else {
            create_nofill_record(self, &mut g, &dn, &mut cx);
        }
        verify(self, &g);
        drop(g);
        drop(evictions);
        if !cx.txg_already_dirty {
            finish_free_accounting(&dn, &cx);
            dirty_parent(self, &dn, tx, topo, false)?;
        }
        Ok(())
    }

    /// The filler is done with the frontend.  Transitions out of FILL and,
    /// if a free raced the fill, zeroes the buffer instead.
    pub fn fill_done(self: &Arc<Self>, tx: &Tx) {
        let mut g = self.mtx.lock();
        verify(self, &g);
        let mut waiters = Vec::new();
        if g.state.contains(DbufState::FILL) {
            let idx = g
                .dirty_index_for(tx.txg())
                .expect("filler owns a dirty record");
            debug_assert_eq!(
                g.newest_dirty().expect("record exists").txg,
                tx.txg(),
                "filler's record must be newest"
            );
            debug_assert!(g.data_pending != Some(tx.txg()));

            if g.freed_in_flight {
                debug_assert!(self.level().is_leaf());
                debug_assert!(!self.blkid().is_bonus());
                // Freed while filling: the TXG observes zeros.
                if let Some(buf) = &g.data {
                    buf.fill(0);
                }
                g.freed_in_flight = false;
                let cleared = g.dirty_records[idx].clear_leaf_ranges();
                note_range_delta(self, cleared, 0);
                set_state(
                    self,
                    &mut g,
                    DbufState::CACHED,
                    "fill done handling freed in flight",
                );
                waiters = take_waiters(&mut g);
                if let Some(wio) = g.dirty_records[idx].take_override_io() {
                    wio.dispatch();
                }
            } else if g.state == DbufState::FILL {
                set_state(
                    self,
                    &mut g,
                    DbufState::CACHED,
                    "filler finished, complete buffer",
                );
                waiters = take_waiters(&mut g);
                if let Some(wio) = g.dirty_records[idx].take_override_io() {
                    wio.dispatch();
                }
            } else {
                crate::clear_state_bits(
                    self,
                    &mut g,
                    DbufState::FILL,
                    "filler finished, incomplete buffer",
                );
                debug_assert!(g.state.intersects(
                    DbufState::PARTIAL.with(DbufState::READ)
                ));
            }
            self.changed.notify_all();
        }
        drop(g);
        run_waiters(waiters, true);
    }

    /// Install a fully prepared buffer as this block's content for `tx`.
    /// The buffer must be store-allocated and block-sized.
    pub fn assign_buf(self: &Arc<Self>, buf: CacheBuf, tx: &Tx) -> Result<()> {
        assert!(self.holds() > 0);
        assert!(!self.blkid().is_bonus());
        assert!(self.level().is_leaf());
        assert!(tx.txg().0 != 0);
        assert_eq!(buf.len(), self.block_size());
        assert!(buf.is_released(), "assigned buffers must be anonymous");
        let topo = *self.dnode().topology.read();
        let size = self.block_size();
        dirty_leaf(self, tx, 0, size, Some(buf), topo, false)?;
        self.fill_done(tx);
        Ok(())
    }
}

// --- undirty and free-range ----------------------------------------------

/// Destroy the record of `tx`'s TXG, if any.  Returns the guard when the
/// dbuf survives, or `Err(())` when removing the record's hold destroyed
/// it.  A record owned by an active filler is left alone; the
/// freed-in-flight protocol cleans it up instead.
pub(crate) fn undirty<'a>(
    db: &Arc<Dbuf>,
    mut g: Guard<'a>,
    tx: &Tx,
    evictions: &mut EvictionList,
) -> std::result::Result<Guard<'a>, ()> {
    let txg = tx.txg();
    assert!(txg.0 != 0);
    assert!(db.level().is_leaf());
    assert!(!db.blkid().is_bonus());

    let Some(idx) = g.dirty_index_for(txg) else {
        return Ok(g);
    };
    if g.state.contains(DbufState::FILL) {
        return Ok(g);
    }
    // A record the sync path owns is retired by write completion only.
    assert!(g.data_pending != Some(txg), "undirty of a syncing record");
    debug_assert!(g.holds >= g.dirty_count() as u64);

    let dn = db.dnode();
    let mut dr = g.dirty_records.remove(idx);

    // Unlink from whichever list the dirty path registered it on.  The
    // topology write lock held by free-range callers excludes concurrent
    // linkage.
    if let Some(children) = dr.parent_children.take() {
        children.lock().retain(|child| !Arc::ptr_eq(child, db));
    } else {
        dn.remove_dirty(txg, db);
    }

    if g.state != DbufState::NOFILL {
        unoverride(db, &mut dr);
        debug_assert!(g.data.is_some());
        debug_assert!(dr.leaf_data().is_some());
        // A record buffer distinct from the frontend dies with the record.
    }
    let cleared = dr.clear_leaf_ranges();
    note_range_delta(db, cleared, 0);
    drop(dr);

    trace!(target: "tephra::dbuf", event = "undirty", key = %db.key(), txg = txg.0);
    db.changed.notify_all();

    // Drop the TXG hold the record carried.
    assert!(g.holds > 0);
    g.holds -= 1;
    if g.holds == 0 {
        let buf = g.data.clone();
        clear_data(db, &mut g, evictions);
        if let Some(buf) = buf {
            db.env().store().release(&buf);
        }
        clear_and_destroy(db, g, evictions);
        return Err(());
    }
    Ok(g)
}

/// Disassociate the live frontend from records of older TXGs before the
/// current TXG's view is zeroed by a free.
fn free_range_disassociate<'a>(
    db: &'a Arc<Dbuf>,
    dn: &Dnode,
    tx: &Tx,
    mut g: Guard<'a>,
) -> Guard<'a> {
    let Some(newest_txg) = g.newest_dirty().map(|dr| dr.txg) else {
        return g;
    };

    if newest_txg == tx.txg() {
        // The buffer is in use in this TXG; it may carry new data when it
        // syncs, so the logical extent keeps covering it.
        if !db.blkid().is_spill() {
            dn.new_blkid(db.blkid());
        }
        let idx = g.dirty_index_for(newest_txg).expect("newest exists");
        unoverride(db, &mut g.dirty_records[idx]);
        // Any outstanding RMW merge no longer applies to this buffer.
        let cleared = g.dirty_records[idx].clear_leaf_ranges();
        note_range_delta(db, cleared, 0);
        return g;
    }

    if g.state.contains(DbufState::PARTIAL) {
        // Resolve the older TXG's record before the PARTIAL state is lost.
        g = transition_to_read(db, true, g);
    }

    let Some(frontend) = g.data.clone() else {
        return g;
    };
    let newest_aliases = g
        .newest_dirty()
        .and_then(DirtyRecord::leaf_data)
        .is_some_and(|data| CacheBuf::same_buf(&data, &frontend));
    if !newest_aliases {
        return g;
    }

    let buf = alloc_frontend(db, g.block_size);
    if g.holds > g.dirty_count() as u64 {
        debug_assert!(g.data_pending != Some(newest_txg));
        if g.state.contains(DbufState::READ) {
            // The reader has yet to see the frontend (it waits out READ),
            // so the frontend itself can be replaced.
            set_data(db, &mut g, buf);
        } else {
            // A reader may be looking at the frontend; give the older
            // record the copy instead.
            buf.copy_from(&frontend);
            let idx = g.dirty_index_for(newest_txg).expect("newest exists");
            g.dirty_records[idx].set_leaf_data(buf);
        }
    } else {
        // Unreferenced foreground: install a fresh buffer so any future
        // reader finds a CACHED zeroed block rather than confusing the
        // in-progress resolution of older records.
        set_data(db, &mut g, buf);
    }
    g
}

impl Dnode {
    /// Free the inclusive block range `[start, end]` in `tx`.
    ///
    /// The view of the range in the current TXG becomes zeros while data
    /// seen by earlier TXGs is preserved; level-1 indirects covering the
    /// range are force-dirtied so the frees propagate at sync.
    pub fn free_range(self: &Arc<Self>, start: BlockId, end: BlockId, tx: &Tx) -> Result<()> {
        let topo_guard = self.topology.write();
        let topo = *topo_guard;
        let spill_free = start.is_spill();
        assert!(spill_free == end.is_spill(), "mixed spill/ordinary range");

        let mut end_id = end.0;
        if !spill_free {
            let maxblkid = self.phys.lock().maxblkid;
            if end_id > maxblkid {
                end_id = maxblkid;
            }
            self.add_freed(start.0, end_id, tx.txg());
        }
        trace!(
            target: "tephra::dbuf",
            event = "free_range",
            object = self.object().0,
            start = start.0,
            end = end_id,
            txg = tx.txg().0
        );

        // The write-held topology lock excludes new holds, so a snapshot
        // of the dbuf list is stable against creation (teardown of
        // entries we visit is handled per-dbuf).
        let snapshot = self.dbufs.lock().clone();
        let epbs = topo.epbs();
        for db in snapshot {
            let blkid = db.blkid();
            let level = db.level();
            debug_assert!(!blkid.is_bonus());

            if !level.is_leaf() {
                // Level-1 indirects covering the range must stay dirty so
                // the freed children propagate.
                if !spill_free && level.0 == 1 {
                    let first_l1 = start.0 >> epbs;
                    let last_l1 = end_id >> epbs;
                    if (first_l1..=last_l1).contains(&blkid.0) {
                        let needs_dirty = {
                            let g = db.mtx.lock();
                            g.newest_dirty().is_some_and(|dr| dr.txg < tx.txg())
                        };
                        if needs_dirty {
                            add_ref(&db, "free_range");
                            db.will_dirty_impl(tx, topo, true)?;
                            rele(&db, "free_range");
                        }
                    }
                }
                continue;
            }

            if spill_free {
                if !blkid.is_spill() {
                    continue;
                }
            } else if !blkid.is_ordinary() || !(start.0..=end_id).contains(&blkid.0) {
                continue;
            }

            let mut evictions = EvictionList::new();
            let g = db.mtx.lock();
            let mut g = match undirty(&db, g, tx, &mut evictions) {
                Ok(g) => g,
                Err(()) => continue,
            };
            verify(&db, &g);

            // Already holds no data in this TXG.
            if g.state.intersects(
                DbufState::UNCACHED
                    .with(DbufState::NOFILL)
                    .with(DbufState::EVICTING),
            ) {
                debug_assert!(g.data.is_none());
                continue;
            }
            // An active filler cannot have its buffer cleared underfoot;
            // it zeroes the buffer itself when it finishes.
            if g.state.contains(DbufState::FILL) {
                g.freed_in_flight = true;
                continue;
            }
            // No consumers left: just drop the buffer.
            if g.holds == 0 {
                debug_assert!(g.data.is_some());
                clear_and_destroy(&db, g, &mut evictions);
                continue;
            }

            g = free_range_disassociate(&db, self, tx, g);

            let dr_this_txg = g
                .newest_dirty()
                .is_some_and(|dr| dr.txg == tx.txg());

            if g.data.is_none() {
                debug_assert!(g.state.contains(DbufState::READ));
                let buf = alloc_frontend(&db, g.block_size);
                set_data(&db, &mut g, buf);
            } else {
                let frontend = g.data.clone().expect("checked");
                self.env().store().release(&frontend);
            }
            if let Some(buf) = &g.data {
                buf.fill(0);
                buf.freeze();
            }
            if dr_this_txg
                && let Some(idx) = g.dirty_index_for(tx.txg())
                && let Some(wio) = g.dirty_records[idx].take_override_io()
            {
                wio.dispatch();
            }
            set_state(&db, &mut g, DbufState::CACHED, "zeroed by free");
            let waiters = take_waiters(&mut g);
            db.changed.notify_all();
            drop(g);
            run_waiters(waiters, true);
            // Evictions for this dbuf drain here, one dbuf at a time.
            drop(evictions);
        }
        drop(topo_guard);
        Ok(())
    }

    /// Remove the spill region in `tx`.
    pub fn rm_spill(self: &Arc<Self>, tx: &Tx) -> Result<()> {
        self.free_range(BlockId::SPILL, BlockId::SPILL, tx)
    }
}

// --- resize ---------------------------------------------------------------

impl Dbuf {
    /// Change this block's size, preserving the overlapping prefix and
    /// zeroing any extension.  The caller holds the topology write lock.
    pub(crate) fn resize_impl(self: &Arc<Self>, new_size: usize, tx: &Tx, topo: Topology) -> Result<()> {
        assert!(!self.blkid().is_bonus());
        let dn = self.dnode();
        let old_size = self.block_size();

        // There can be no other references while a block is resized, so no
        // concurrent filler exists and the full-block dirty is safe.
        self.will_dirty_impl(tx, topo, true)?;

        let buf = alloc_frontend(self, new_size);
        let mut g = self.mtx.lock();
        if let Some(old) = &g.data {
            buf.copy_from(old);
        }
        set_data(self, &mut g, buf.clone());
        g.block_size = new_size;
        if self.level().is_leaf() {
            let idx = g
                .dirty_index_for(tx.txg())
                .expect("will_dirty created the record");
            g.dirty_records[idx].set_leaf_data(buf);
            if let Some(leaf) = g.dirty_records[idx].leaf_mut() {
                leaf.ranges.truncate(new_size);
            }
        }
        drop(g);
        dn.willuse_space(new_size as i64 - old_size as i64);
        Ok(())
    }

    /// Set the spill region's block size.  Returns `Unsupported` when this
    /// dbuf is not the spill region.
    pub fn spill_set_blksz(self: &Arc<Self>, size: usize, tx: &Tx) -> Result<()> {
        if !self.blkid().is_spill() {
            return Err(tephra_error::TephraError::Unsupported(
                "block size changes apply to the spill region only",
            ));
        }
        let quantum = tephra_types::MIN_BLOCK_SIZE as usize;
        let max = tephra_types::MAX_BLOCK_SIZE as usize;
        let size = if size == 0 {
            quantum
        } else {
            size.div_ceil(quantum) * quantum
        }
        .min(max);
        let dn = self.dnode();
        let topo_guard = dn.topology.write();
        let topo = *topo_guard;
        self.resize_impl(size, tx, topo)
    }
}

impl crate::DbufEnv {
    pub(crate) fn counters_ranges_in_flight(&self, delta: i64) {
        self.counters.ranges_in_flight.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn counters_ranges_total(&self, delta: u64) {
        self.counters.dirty_ranges_total.fetch_add(delta, Ordering::Relaxed);
    }
}
