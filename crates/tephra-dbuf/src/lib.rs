#![forbid(unsafe_code)]
//! Per-block transactional buffer cache.
//!
//! A dbuf is the in-memory image of one logical block of one object,
//! identified by `(dataset, object, level, block-id)` and found through a
//! striped hash index.  Each dbuf presents a stable per-TXG snapshot to
//! readers and writers, coalesces partial overwrites with in-flight
//! read-modify-write fills, hands finalized per-TXG buffers to the syncing
//! context for write-out, and recycles itself through hold counts and an
//! eviction callback bound to the backing cache.
//!
//! Concurrency model: preemptive OS threads.  Contended dbufs serialize on
//! the per-dbuf mutex; state transitions are announced on the per-dbuf
//! condition variable.  Lock order, top-down: dnode topology rwlock >
//! dnode dbufs mutex > hash stripe mutex > parent record mutex > dbuf
//! mutex > dnode phys/freed mutexes.

mod dirty;
mod dnode;
mod index;
mod range;
mod state;
mod sync;

pub use dnode::{Dnode, DnodeSpec, Topology, Tx};
pub use index::IndexMetrics;
pub use range::{RangeList, WriteRange};
pub use state::DbufState;

use crate::dirty::DirtyRecord;
use crate::index::DbufIndex;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tephra_error::{Result, TephraError};
use tephra_store::{ArcStore, CacheBuf, ContentKind, Io, IoPriority};
use tephra_types::{
    BLKPTR_SIZE, BlockId, BlockPtr, DbufKey, Level, MIN_BLOCK_SIZE, TXG_CONCURRENT_STATES, TxgId,
};
use tracing::{debug, trace, warn};

/// Buffer-cache configuration.
#[derive(Debug, Clone, Copy)]
pub struct DbufConfig {
    /// Stripe count for the hash index; must be a power of two.
    pub hash_stripes: usize,
    /// Run the full state verifier at protocol boundaries.
    pub verify: bool,
}

impl Default for DbufConfig {
    fn default() -> Self {
        Self {
            hash_stripes: 256,
            verify: cfg!(debug_assertions),
        }
    }
}

impl DbufConfig {
    pub fn validate(self) -> Result<Self> {
        if self.hash_stripes == 0 || !self.hash_stripes.is_power_of_two() {
            return Err(TephraError::Format(
                "hash_stripes must be a nonzero power of two".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Snapshot of buffer-cache counters; all monotonically increasing except
/// `ranges_in_flight`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbufMetrics {
    /// Dirty content whose backing read failed; durability of the original
    /// bytes is forfeit.
    pub dirty_writes_lost: u64,
    pub user_evicts: u64,
    pub resolves_completed: u64,
    /// Writes the syncer prepared but had to park until a resolve finished.
    pub deferred_resolves: u64,
    /// Parked writes later dispatched by resolve completion.
    pub deferred_write_ios: u64,
    pub dirty_ranges_total: u64,
    pub ranges_in_flight: i64,
}

#[derive(Debug, Default)]
pub(crate) struct EnvCounters {
    pub(crate) dirty_writes_lost: AtomicU64,
    pub(crate) user_evicts: AtomicU64,
    pub(crate) resolves_completed: AtomicU64,
    pub(crate) deferred_resolves: AtomicU64,
    pub(crate) deferred_write_ios: AtomicU64,
    pub(crate) dirty_ranges_total: AtomicU64,
    pub(crate) ranges_in_flight: AtomicI64,
}

/// Process-wide state of the buffer cache: the hash index, the backing
/// store, and counters.  Owned by the embedding pool module; dropping it
/// tears the cache down.
pub struct DbufEnv {
    pub(crate) index: DbufIndex,
    store: Arc<ArcStore>,
    config: DbufConfig,
    pub(crate) counters: EnvCounters,
}

impl std::fmt::Debug for DbufEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbufEnv")
            .field("index", &self.index)
            .finish()
    }
}

impl DbufEnv {
    pub fn new(store: Arc<ArcStore>, config: DbufConfig) -> Result<Arc<Self>> {
        let config = config.validate()?;
        Ok(Arc::new(Self {
            index: DbufIndex::new(config.hash_stripes),
            store,
            config,
            counters: EnvCounters::default(),
        }))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ArcStore> {
        &self.store
    }

    #[must_use]
    pub fn metrics(&self) -> DbufMetrics {
        DbufMetrics {
            dirty_writes_lost: self.counters.dirty_writes_lost.load(Ordering::Relaxed),
            user_evicts: self.counters.user_evicts.load(Ordering::Relaxed),
            resolves_completed: self.counters.resolves_completed.load(Ordering::Relaxed),
            deferred_resolves: self.counters.deferred_resolves.load(Ordering::Relaxed),
            deferred_write_ios: self.counters.deferred_write_ios.load(Ordering::Relaxed),
            dirty_ranges_total: self.counters.dirty_ranges_total.load(Ordering::Relaxed),
            ranges_in_flight: self.counters.ranges_in_flight.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn index_metrics(&self) -> IndexMetrics {
        self.index.metrics()
    }

    #[cfg(test)]
    pub(crate) fn new_in_memory_for_tests() -> Arc<Self> {
        let store = ArcStore::new(
            Arc::new(tephra_store::MemBackend::new()),
            tephra_store::StoreConfig::default(),
        )
        .unwrap();
        Self::new(store, DbufConfig::default()).unwrap()
    }
}

/// A client record attached to a dbuf, notified when the dbuf's identity is
/// torn down.
pub trait DbufUser: Send + Sync {
    fn evicted(self: Arc<Self>);
}

/// Deferred user-eviction callbacks, drained only after every dbuf mutex is
/// released so client code never runs under cache locks.
pub(crate) struct EvictionList {
    users: Vec<Arc<dyn DbufUser>>,
}

impl EvictionList {
    pub(crate) fn new() -> Self {
        Self { users: Vec::new() }
    }

    pub(crate) fn push(&mut self, user: Arc<dyn DbufUser>) {
        self.users.push(user);
    }
}

impl Drop for EvictionList {
    fn drop(&mut self) {
        for user in self.users.drain(..) {
            user.evicted();
        }
    }
}

/// Where this dbuf's block pointer lives.
///
/// The pointer aliases a slot inside either the object descriptor or the
/// parent indirect's payload; the parent is held (and its payload buffer
/// identity is stable) for as long as this dbuf exists, which is what makes
/// the alias sound.
#[derive(Clone)]
pub(crate) enum BlkptrSlot {
    /// Not yet assigned; the block has no parent pointer.
    None,
    /// Slot in the descriptor's root block-pointer array.
    Dnode { slot: usize },
    /// The descriptor's spill pointer.
    Spill,
    /// Slot inside the parent indirect's payload.
    Indirect {
        parent: Arc<Dbuf>,
        buf: CacheBuf,
        index: usize,
    },
}

impl BlkptrSlot {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl std::fmt::Debug for BlkptrSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Dnode { slot } => write!(f, "Dnode[{slot}]"),
            Self::Spill => write!(f, "Spill"),
            Self::Indirect { index, .. } => write!(f, "Indirect[{index}]"),
        }
    }
}

/// Read the pointer a slot aliases.  `None` means "no pointer yet", which
/// readers treat as a hole.
pub(crate) fn read_slot_blkptr(slot: &BlkptrSlot, dn: &Dnode) -> Option<BlockPtr> {
    match slot {
        BlkptrSlot::None => None,
        BlkptrSlot::Dnode { slot } => Some(dn.phys.lock().blkptr[*slot]),
        BlkptrSlot::Spill => dn.phys.lock().spill,
        BlkptrSlot::Indirect { buf, index, .. } => buf.with_data(|data| {
            let at = index * BLKPTR_SIZE;
            BlockPtr::read_from(&data[at..at + BLKPTR_SIZE]).ok()
        }),
    }
}

/// Publish `bp` through the slot.  For an indirect slot the parent's
/// payload must have been released for modification by the sync path.
pub(crate) fn write_slot_blkptr(slot: &BlkptrSlot, dn: &Dnode, bp: &BlockPtr) {
    match slot {
        BlkptrSlot::None => panic!("publishing a block pointer with no slot"),
        BlkptrSlot::Dnode { slot } => dn.phys.lock().blkptr[*slot] = *bp,
        BlkptrSlot::Spill => dn.phys.lock().spill = Some(*bp),
        BlkptrSlot::Indirect { buf, index, .. } => buf.with_data_mut(|data| {
            let at = index * BLKPTR_SIZE;
            bp.write_to(&mut data[at..at + BLKPTR_SIZE]);
        }),
    }
}

type ReadWaiter = Box<dyn FnOnce(Result<()>) + Send>;

pub(crate) struct DbufInner {
    pub(crate) state: DbufState,
    pub(crate) block_size: usize,
    /// The frontend: the live buffer visible to readers and writers.
    pub(crate) data: Option<CacheBuf>,
    /// Newest-first; TXGs strictly decreasing.
    pub(crate) dirty_records: Vec<DirtyRecord>,
    /// TXG of the oldest record, once handed to the sync path.
    pub(crate) data_pending: Option<TxgId>,
    pub(crate) holds: u64,
    pub(crate) parent: Option<Arc<Dbuf>>,
    pub(crate) blkptr: BlkptrSlot,
    pub(crate) user: Option<Arc<dyn DbufUser>>,
    pub(crate) immediate_evict: bool,
    pub(crate) freed_in_flight: bool,
    pub(crate) read_waiters: Vec<ReadWaiter>,
}

impl DbufInner {
    pub(crate) fn dirty_count(&self) -> usize {
        self.dirty_records.len()
    }

    /// Newest dirty record, if any.
    pub(crate) fn newest_dirty(&self) -> Option<&DirtyRecord> {
        self.dirty_records.first()
    }

    pub(crate) fn oldest_dirty(&self) -> Option<&DirtyRecord> {
        self.dirty_records.last()
    }

    pub(crate) fn dirty_index_for(&self, txg: TxgId) -> Option<usize> {
        self.dirty_records.iter().position(|dr| dr.txg == txg)
    }
}

pub(crate) type Guard<'a> = MutexGuard<'a, DbufInner>;

/// One cached block.
pub struct Dbuf {
    key: DbufKey,
    env: Arc<DbufEnv>,
    dnode: Weak<Dnode>,
    pub(crate) mtx: Mutex<DbufInner>,
    pub(crate) changed: Condvar,
}

impl std::fmt::Debug for Dbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.mtx.lock();
        f.debug_struct("Dbuf")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("holds", &inner.holds)
            .field("dirty", &inner.dirty_count())
            .finish()
    }
}

/// What a read call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Satisfied synchronously (resident hit, bonus, or hole synthesis).
    pub cached: bool,
}

/// Flags for [`Dbuf::read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    /// The caller already holds the dnode topology lock.
    pub have_struct: bool,
    /// Do not block waiting on another thread's in-flight READ/FILL.
    pub never_wait: bool,
}

impl Dbuf {
    pub(crate) fn new_internal(
        env: Arc<DbufEnv>,
        dn: &Arc<Dnode>,
        key: DbufKey,
        block_size: usize,
        parent: Option<Arc<Dbuf>>,
        blkptr: BlkptrSlot,
    ) -> Arc<Self> {
        trace!(
            target: "tephra::dbuf",
            event = "dbuf_create",
            key = %key,
            block_size
        );
        Arc::new(Self {
            key,
            env,
            dnode: Arc::downgrade(dn),
            mtx: Mutex::new(DbufInner {
                state: DbufState::UNCACHED,
                block_size,
                data: None,
                dirty_records: Vec::new(),
                data_pending: None,
                holds: 0,
                parent,
                blkptr,
                user: None,
                immediate_evict: false,
                freed_in_flight: false,
                read_waiters: Vec::new(),
            }),
            changed: Condvar::new(),
        })
    }

    #[must_use]
    pub fn key(&self) -> DbufKey {
        self.key
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.key.level
    }

    #[must_use]
    pub fn blkid(&self) -> BlockId {
        self.key.blkid
    }

    #[must_use]
    pub fn env(&self) -> &Arc<DbufEnv> {
        &self.env
    }

    pub(crate) fn dnode(&self) -> Arc<Dnode> {
        self.dnode.upgrade().expect("dnode outlives its dbufs")
    }

    /// Current state bits (snapshot).
    #[must_use]
    pub fn state(&self) -> DbufState {
        self.mtx.lock().state
    }

    #[must_use]
    pub fn holds(&self) -> u64 {
        self.mtx.lock().holds
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.mtx.lock().dirty_count()
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.mtx.lock().block_size
    }

    /// Inspect the frontend contents, if any.
    pub fn with_frontend<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.mtx.lock();
        let buf = inner.data.clone()?;
        drop(inner);
        Some(buf.with_data(f))
    }

    /// Mutate the frontend contents.  Only valid between a `will_*` call
    /// and the matching [`Dbuf::fill_done`] (or on a freshly assigned
    /// buffer): that is the window in which the caller owns the fill.
    pub fn with_frontend_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let inner = self.mtx.lock();
        let buf = inner.data.clone()?;
        drop(inner);
        Some(buf.with_data_mut(f))
    }

    /// TXG of the record currently handed to the sync path, if any.
    #[must_use]
    pub fn pending_txg(&self) -> Option<TxgId> {
        self.mtx.lock().data_pending
    }

    /// Inspect the buffer a TXG's dirty record would sync (test/diagnostic
    /// surface).
    pub fn with_dirty_data<R>(&self, txg: TxgId, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.mtx.lock();
        let idx = inner.dirty_index_for(txg)?;
        let buf = inner.dirty_records[idx].leaf_data()?;
        drop(inner);
        Some(buf.with_data(f))
    }

    /// Write ranges currently recorded for a TXG's dirty record.
    #[must_use]
    pub fn dirty_ranges(&self, txg: TxgId) -> Option<Vec<WriteRange>> {
        let inner = self.mtx.lock();
        let idx = inner.dirty_index_for(txg)?;
        inner.dirty_records[idx]
            .leaf_ranges()
            .map(|r| r.as_slice().to_vec())
    }

    /// Register a callback to run once this dbuf reaches CACHED (or a read
    /// fails).  Runs immediately if already cached.
    pub fn when_cached(&self, cb: impl FnOnce(Result<()>) + Send + 'static) {
        let mut inner = self.mtx.lock();
        if inner.state == DbufState::CACHED {
            drop(inner);
            cb(Ok(()));
        } else {
            inner.read_waiters.push(Box::new(cb));
        }
    }

    // --- user records -----------------------------------------------------

    /// Attach `user` if no user is attached.  Returns `None` on success or
    /// the current occupant.
    pub fn set_user(&self, user: Arc<dyn DbufUser>) -> Option<Arc<dyn DbufUser>> {
        let mut inner = self.mtx.lock();
        debug_assert!(self.key.level.is_leaf(), "user records are leaf-only");
        if inner.user.is_none() {
            inner.user = Some(user);
            None
        } else {
            inner.user.clone()
        }
    }

    /// As [`Dbuf::set_user`], additionally requesting eviction callbacks as
    /// soon as the last non-TXG hold is released.
    pub fn set_user_immediate_evict(&self, user: Arc<dyn DbufUser>) -> Option<Arc<dyn DbufUser>> {
        self.mtx.lock().immediate_evict = true;
        self.set_user(user)
    }

    #[must_use]
    pub fn get_user(&self) -> Option<Arc<dyn DbufUser>> {
        self.mtx.lock().user.clone()
    }

    /// Remove `user` if it is the current occupant; returns it on success,
    /// `None` (leaving the occupant in place) otherwise.
    pub fn remove_user(&self, user: &Arc<dyn DbufUser>) -> Option<Arc<dyn DbufUser>> {
        let mut inner = self.mtx.lock();
        if inner
            .user
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, user))
        {
            inner.user.take()
        } else {
            None
        }
    }

    /// Swap `new` in if the occupant is `old`; returns the occupant that
    /// was displaced (or the one that blocked the swap).
    pub fn replace_user(
        &self,
        old: Option<&Arc<dyn DbufUser>>,
        new: Option<Arc<dyn DbufUser>>,
    ) -> Option<Arc<dyn DbufUser>> {
        let mut inner = self.mtx.lock();
        let matches = match (inner.user.as_ref(), old) {
            (Some(current), Some(old)) => Arc::ptr_eq(current, old),
            (None, None) => true,
            _ => false,
        };
        if matches {
            let prev = inner.user.take();
            inner.user = new;
            prev
        } else {
            inner.user.clone()
        }
    }

    // --- read path --------------------------------------------------------

    /// Read this dbuf's block, returning once the frontend is valid (or the
    /// request has been queued behind `pio`).
    pub fn read(self: &Arc<Self>, pio: Option<&Io>, flags: ReadFlags) -> Result<ReadOutcome> {
        let dn = self.dnode();
        let topo_guard = if flags.have_struct {
            None
        } else {
            Some(dn.topology.read())
        };

        let mut g = self.mtx.lock();
        assert!(g.holds > 0, "read of an unheld dbuf");

        if g.state == DbufState::NOFILL {
            return Err(TephraError::NoData);
        }
        if g.state == DbufState::CACHED {
            return Ok(ReadOutcome { cached: true });
        }

        if g.state.intersects(DbufState::UNCACHED.with(DbufState::PARTIAL)) {
            if read_bonus(self, &mut g, &dn) || read_hole(self, &mut g, &dn) {
                let waiters = take_waiters(&mut g);
                drop(g);
                drop(topo_guard);
                run_waiters(waiters, true);
                return Ok(ReadOutcome { cached: true });
            }

            if g.state.contains(DbufState::PARTIAL) {
                merge_state(self, &mut g, DbufState::READ, "read issued");
            } else {
                set_state(self, &mut g, DbufState::READ, "read issued");
            }
            g.holds += 1; // released by read_done
            let bp = self
                .read_blkptr_locked(&g, &dn)
                .expect("non-hole block has a pointer");
            drop(g);

            let root;
            let parent_io = match pio {
                Some(io) => io,
                None => {
                    root = Io::root(self.env.store.executor());
                    &root
                }
            };
            let me = Arc::clone(self);
            let dispatch = self.env.store.read(
                Some(parent_io),
                &bp,
                IoPriority::SyncRead,
                false,
                Box::new(move |result, buf| read_done(&me, result, buf)),
            );
            drop(topo_guard);
            if pio.is_none() {
                parent_io.wait().map_err(|_| TephraError::ReadFailed)?;
            }
            return Ok(ReadOutcome {
                cached: dispatch.cached,
            });
        }

        // Another reader or writer has the block in flight between UNCACHED
        // and CACHED.  Wait for the transition unless told not to.
        drop(g);
        drop(topo_guard);
        if !flags.never_wait {
            let mut g = self.mtx.lock();
            while g.state.intersects(DbufState::READ.with(DbufState::FILL)) {
                self.changed.wait(&mut g);
            }
            if g.state == DbufState::UNCACHED {
                return Err(TephraError::ReadFailed);
            }
        }
        Ok(ReadOutcome { cached: false })
    }

    pub(crate) fn read_blkptr_locked(&self, g: &DbufInner, dn: &Dnode) -> Option<BlockPtr> {
        read_slot_blkptr(&g.blkptr, dn)
    }

    /// Exposed pointer of this block, as the embedding layers see it.
    #[must_use]
    pub fn blkptr(&self) -> Option<BlockPtr> {
        let dn = self.dnode();
        let g = self.mtx.lock();
        self.read_blkptr_locked(&g, &dn)
    }
}

// --- internal helpers shared across the dirty and sync paths --------------

pub(crate) fn set_state(db: &Dbuf, g: &mut DbufInner, new: DbufState, why: &str) {
    debug_assert!(new.is_legal(), "illegal state {new:?} ({why})");
    trace!(
        target: "tephra::dbuf",
        event = "state_change",
        key = %db.key,
        from = %g.state,
        to = %new,
        why
    );
    g.state = new;
}

pub(crate) fn merge_state(db: &Dbuf, g: &mut DbufInner, bits: DbufState, why: &str) {
    let new = g.state.with(bits);
    set_state(db, g, new, why);
}

pub(crate) fn clear_state_bits(db: &Dbuf, g: &mut DbufInner, bits: DbufState, why: &str) {
    let new = g.state.without(bits);
    set_state(db, g, new, why);
}

pub(crate) fn content_kind(db: &Dbuf) -> ContentKind {
    if db.key.level.is_leaf() && !db.key.object.is_meta() {
        ContentKind::Data
    } else {
        ContentKind::Metadata
    }
}

pub(crate) fn alloc_frontend(db: &Dbuf, size: usize) -> CacheBuf {
    db.env.store.alloc(size, content_kind(db))
}

fn arm_evict_callback(db: &Arc<Dbuf>, buf: &CacheBuf) {
    let weak = Arc::downgrade(db);
    buf.set_evict_callback(move || {
        if let Some(db) = weak.upgrade() {
            buffer_evicted(&db);
        }
    });
}

/// Install `buf` as the frontend.
pub(crate) fn set_data(db: &Arc<Dbuf>, g: &mut DbufInner, buf: CacheBuf) {
    if let Some(old) = &g.data {
        old.clear_evict_callback();
    }
    if !buf.is_released() {
        arm_evict_callback(db, &buf);
    }
    g.data = Some(buf);
}

/// Drop the frontend and (unless NOFILL) return to UNCACHED.
pub(crate) fn clear_data(db: &Arc<Dbuf>, g: &mut DbufInner, evictions: &mut EvictionList) {
    evict_user(db, g, evictions);
    if let Some(old) = g.data.take() {
        old.clear_evict_callback();
    }
    if !g.state.contains(DbufState::NOFILL) {
        set_state(db, g, DbufState::UNCACHED, "clear data");
    }
}

pub(crate) fn evict_user(db: &Dbuf, g: &mut DbufInner, evictions: &mut EvictionList) {
    if let Some(user) = g.user.take() {
        db.env.counters.user_evicts.fetch_add(1, Ordering::Relaxed);
        evictions.push(user);
    }
}

pub(crate) fn take_waiters(g: &mut DbufInner) -> Vec<ReadWaiter> {
    std::mem::take(&mut g.read_waiters)
}

pub(crate) fn run_waiters(waiters: Vec<ReadWaiter>, ok: bool) {
    for waiter in waiters {
        if ok {
            waiter(Ok(()));
        } else {
            waiter(Err(TephraError::ReadFailed));
        }
    }
}

/// Debug-build protocol verifier.
pub(crate) fn verify(db: &Dbuf, g: &DbufInner) {
    if !cfg!(debug_assertions) || !db.env.config.verify {
        return;
    }
    assert!(g.state.is_legal(), "illegal state {:?}", g.state);
    assert!(
        g.dirty_count() <= TXG_CONCURRENT_STATES,
        "dirty count exceeds concurrent TXG bound"
    );
    if g.state.contains(DbufState::PARTIAL) {
        assert_eq!(g.dirty_count(), 1, "PARTIAL implies exactly one dirty record");
    }
    for pair in g.dirty_records.windows(2) {
        assert!(
            pair[0].txg > pair[1].txg,
            "dirty records must be strictly TXG-ordered"
        );
    }
    if let Some(pending) = g.data_pending {
        let oldest = g.oldest_dirty().expect("pending record must exist");
        assert_eq!(oldest.txg, pending, "pending record must be the oldest");
    }
    for dr in &g.dirty_records {
        if let Some(ranges) = dr.leaf_ranges() {
            for pair in ranges.as_slice().windows(2) {
                assert!(pair[0].end < pair[1].start, "ranges must be disjoint");
            }
        }
    }
}

// --- hold / rele ----------------------------------------------------------

/// RAII hold on a dbuf.  Dropping releases it; [`DbufHold::release`] does so
/// explicitly.
pub struct DbufHold {
    db: Option<Arc<Dbuf>>,
    tag: &'static str,
}

impl DbufHold {
    pub(crate) fn new(db: Arc<Dbuf>, tag: &'static str) -> Self {
        Self { db: Some(db), tag }
    }

    #[must_use]
    pub fn dbuf(&self) -> &Arc<Dbuf> {
        self.db.as_ref().expect("hold already released")
    }

    pub fn release(mut self) {
        if let Some(db) = self.db.take() {
            rele(&db, self.tag);
        }
    }
}

impl std::ops::Deref for DbufHold {
    type Target = Arc<Dbuf>;

    fn deref(&self) -> &Arc<Dbuf> {
        self.dbuf()
    }
}

impl Drop for DbufHold {
    fn drop(&mut self) {
        if let Some(db) = self.db.take() {
            rele(&db, self.tag);
        }
    }
}

impl std::fmt::Debug for DbufHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbufHold")
            .field("tag", &self.tag)
            .field("db", &self.db)
            .finish()
    }
}

pub(crate) fn add_ref(db: &Arc<Dbuf>, tag: &'static str) {
    let mut g = db.mtx.lock();
    debug_assert!(g.holds > 0, "add_ref on an unheld dbuf");
    g.holds += 1;
    trace!(target: "tephra::dbuf", event = "hold", key = %db.key, tag, holds = g.holds);
}

pub(crate) fn rele(db: &Arc<Dbuf>, tag: &'static str) {
    let mut evictions = EvictionList::new();
    let g = db.mtx.lock();
    rele_and_unlock(db, g, tag, &mut evictions);
}

/// Drop one hold with the mutex already held; consumes the guard.
pub(crate) fn rele_and_unlock(
    db: &Arc<Dbuf>,
    mut g: Guard<'_>,
    tag: &'static str,
    evictions: &mut EvictionList,
) {
    verify(db, &g);
    assert!(g.holds > 0, "rele without hold");
    g.holds -= 1;
    let holds = g.holds;
    trace!(target: "tephra::dbuf", event = "rele", key = %db.key, tag, holds);

    let level0 = db.key.level.is_leaf();
    let dirty = g.dirty_count() as u64;

    // Once the last non-TXG hold leaves a fully cached buffer, freeze it.
    // The bonus region is descriptor-embedded and carries no cache-buffer
    // immutability protocol.
    if let Some(buf) = &g.data
        && g.state == DbufState::CACHED
        && !db.key.blkid.is_bonus()
        && holds == if level0 { dirty } else { 0 }
    {
        buf.freeze();
    }

    if holds == dirty && level0 && g.immediate_evict {
        evict_user(db, &mut g, evictions);
    }

    if holds > 0 {
        return;
    }

    if db.key.blkid.is_bonus() {
        // The bonus dbuf's lifetime is tied to its descriptor; stay warm.
        return;
    }

    if g.data.is_none() {
        // Never associated with cache data.
        assert!(
            g.state
                .intersects(DbufState::UNCACHED.with(DbufState::NOFILL)),
            "buffer-less dbuf in state {:?}",
            g.state
        );
        clear_and_destroy(db, g, evictions);
        return;
    }

    let buf = g.data.clone().expect("checked above");
    if buf.is_released() {
        // Anonymous data with no holds left; nothing can reach it again.
        clear_data(db, &mut g, evictions);
        clear_and_destroy(db, g, evictions);
        return;
    }

    let dn = db.dnode();
    if !dn.is_cacheable() || db.env.store.duplicate_resident(&buf) {
        clear_and_destroy(db, g, evictions);
    }
    // Otherwise stay warm: the guard drops here.
}

/// Take an idle dbuf to EVICTING, unlink it everywhere, and destroy it.
/// Consumes the guard.
pub(crate) fn clear_and_destroy(db: &Arc<Dbuf>, mut g: Guard<'_>, evictions: &mut EvictionList) {
    assert_eq!(g.holds, 0);
    assert!(g.dirty_records.is_empty(), "clearing a dirty dbuf");
    assert!(g.data_pending.is_none());

    evict_user(db, &mut g, evictions);

    if g.state == DbufState::CACHED {
        set_state(db, &mut g, DbufState::UNCACHED, "buffer cleared");
    }
    assert!(
        g.state
            .intersects(DbufState::UNCACHED.with(DbufState::NOFILL)),
        "evicting from state {:?}",
        g.state
    );
    set_state(db, &mut g, DbufState::EVICTING, "buffer eviction started");

    if let Some(buf) = g.data.take() {
        buf.clear_evict_callback();
        db.env.store.release(&buf);
    }
    g.blkptr = BlkptrSlot::None;
    let parent = g.parent.take();
    let waiters = take_waiters(&mut g);
    drop(g);

    let dn = db.dnode();
    dn.remove_dbuf(db);
    db.env.index.remove(db);
    trace!(target: "tephra::dbuf", event = "dbuf_destroy", key = %db.key);
    run_waiters(waiters, false);

    if let Some(parent) = parent {
        rele(&parent, "child");
    }
}

/// Backing-cache eviction callback: the store reclaimed this dbuf's
/// resident buffer.  Finish teardown if the dbuf is idle; otherwise the
/// next holder observes the invalidated buffer and retries.
fn buffer_evicted(db: &Arc<Dbuf>) {
    let mut evictions = EvictionList::new();
    let g = db.mtx.lock();
    if g.state.contains(DbufState::EVICTING) {
        return;
    }
    if g.holds == 0 && g.dirty_records.is_empty() {
        debug!(target: "tephra::dbuf", event = "backing_evict", key = %db.key);
        clear_and_destroy(db, g, &mut evictions);
    }
}

// --- hold path ------------------------------------------------------------

/// Resolve the parent dbuf and block-pointer slot for `(level, blkid)`.
///
/// Returns `NotFound` when the coordinates lie beyond the object's
/// allocated extent (no parent exists yet).
pub(crate) fn findbp(
    dn: &Arc<Dnode>,
    topo: &Topology,
    level: Level,
    blkid: BlockId,
    fail_sparse: bool,
) -> Result<(Option<Arc<Dbuf>>, BlkptrSlot)> {
    debug_assert!(!blkid.is_bonus());

    if blkid.is_spill() {
        return Ok((None, BlkptrSlot::Spill));
    }

    let nlevels = topo.nlevels;
    let epbs = topo.epbs();
    let maxblkid = dn.phys.lock().maxblkid;
    if level.0 >= nlevels || blkid.0 > (maxblkid >> (u32::from(level.0) * epbs)) {
        return Err(TephraError::NotFound(format!(
            "no parent yet for level {} blkid {}",
            level.0, blkid
        )));
    }

    if level.0 < nlevels - 1 {
        // Referenced from an indirect block one level up.
        let parent = hold_impl(
            dn,
            topo,
            level.up(),
            BlockId(blkid.0 >> epbs),
            fail_sparse,
            "parent",
        )?;
        let read_result = parent.read(
            None,
            ReadFlags {
                have_struct: true,
                never_wait: false,
            },
        );
        if let Err(err) = read_result {
            rele(&parent, "parent");
            return Err(err);
        }
        let buf = parent
            .mtx
            .lock()
            .data
            .clone()
            .expect("parent cached after read");
        let index = (blkid.0 & ((1_u64 << epbs) - 1)) as usize;
        let slot = BlkptrSlot::Indirect {
            parent: Arc::clone(&parent),
            buf,
            index,
        };
        Ok((Some(parent), slot))
    } else {
        // Referenced from the descriptor itself.
        assert!(
            (blkid.0 as usize) < topo.nblkptr,
            "top-level blkid {} exceeds descriptor slots",
            blkid
        );
        Ok((None, BlkptrSlot::Dnode {
            slot: blkid.0 as usize,
        }))
    }
}

/// Find or create the dbuf for `(level, blkid)` and take a hold on it.
/// The caller must hold the dnode topology lock.
pub(crate) fn hold_impl(
    dn: &Arc<Dnode>,
    topo: &Topology,
    level: Level,
    blkid: BlockId,
    fail_sparse: bool,
    tag: &'static str,
) -> Result<Arc<Dbuf>> {
    assert!(!blkid.is_bonus(), "the bonus region is held via hold_bonus");
    assert!(blkid.is_spill() || level.0 < topo.nlevels);
    let env = dn.env();
    let key = DbufKey::new(dn.dataset(), dn.object(), level, blkid);

    loop {
        let db = if let Some(db) = env.index.find(&key) {
            db
        } else {
            let (parent, slot) = match findbp(dn, topo, level, blkid, fail_sparse) {
                Ok(found) => found,
                Err(TephraError::NotFound(_)) if !fail_sparse => (None, BlkptrSlot::None),
                Err(err) => return Err(err),
            };

            if fail_sparse {
                let bp = read_slot_blkptr(&slot, dn);
                if bp.is_none_or(|bp| bp.is_hole()) {
                    if let Some(parent) = &parent {
                        rele(parent, "parent");
                    }
                    return Err(TephraError::NotFound(format!("hole at {key}")));
                }
            }

            let block_size = if blkid.is_spill() {
                read_slot_blkptr(&slot, dn).map_or(MIN_BLOCK_SIZE as usize, |bp| {
                    if bp.is_hole() {
                        MIN_BLOCK_SIZE as usize
                    } else {
                        bp.lsize as usize
                    }
                })
            } else {
                topo.block_size(level)
            };

            let candidate = Dbuf::new_internal(
                Arc::clone(env),
                dn,
                key,
                block_size,
                parent.clone(),
                slot,
            );

            // The dbufs mutex spans the index insert so a concurrent lookup
            // cannot see the dbuf before it is on the object's list.
            let mut dbufs = dn.dbufs.lock();
            match env.index.insert(&candidate) {
                Ok(()) => {
                    dbufs.push(Arc::clone(&candidate));
                    drop(dbufs);
                    if let Some(parent) = &parent {
                        add_ref(parent, "child");
                    }
                    if let Some(parent) = parent {
                        rele(&parent, "parent");
                    }
                    candidate
                }
                Err(_existing) => {
                    drop(dbufs);
                    // Lost the creation race; discard the candidate.
                    if let Some(parent) = parent {
                        rele(&parent, "parent");
                    }
                    continue;
                }
            }
        };

        let mut evictions = EvictionList::new();
        let mut g = db.mtx.lock();
        if g.state.contains(DbufState::EVICTING) {
            continue;
        }

        // The backing cache may have reclaimed the buffer underfoot.
        if g.holds == 0
            && let Some(buf) = &g.data
            && !buf.is_valid()
        {
            clear_and_destroy(&db, g, &mut evictions);
            continue;
        }

        // If the record being synced still references the live frontend, a
        // writer taking this hold could dirty it again in the open TXG and
        // leak into the in-flight write.  Give the frontend a private copy.
        if level.is_leaf()
            && !dn.is_meta()
            && g.state == DbufState::CACHED
            && let Some(pending_txg) = g.data_pending
        {
            debug_assert!(!blkid.is_bonus());
            let pending_idx = g
                .dirty_index_for(pending_txg)
                .expect("pending record exists");
            let pending_data = g.dirty_records[pending_idx].leaf_data();
            if let Some(pending_data) = pending_data
                && g.data
                    .as_ref()
                    .is_some_and(|front| CacheBuf::same_buf(front, &pending_data))
            {
                let copy = alloc_frontend(&db, g.block_size);
                copy.copy_from(&pending_data);
                set_data(&db, &mut g, copy);
            }
        }

        g.holds += 1;
        trace!(target: "tephra::dbuf", event = "hold", key = %db.key, tag, holds = g.holds);
        verify(&db, &g);
        drop(g);
        return Ok(db);
    }
}

impl Dnode {
    /// Hold the bonus region's dbuf.  The bonus dbuf lives outside the hash
    /// index and the per-object dbuf list.
    pub fn hold_bonus(self: &Arc<Self>, tag: &'static str) -> Result<DbufHold> {
        let mut slot = self.bonus_dbuf.lock();
        let db = if let Some(db) = &*slot {
            Arc::clone(db)
        } else {
            let key = DbufKey::new(
                self.dataset(),
                self.object(),
                Level::LEAF,
                BlockId::BONUS,
            );
            let db = Dbuf::new_internal(
                Arc::clone(self.env()),
                self,
                key,
                self.bonus_len(),
                None,
                BlkptrSlot::None,
            );
            *slot = Some(Arc::clone(&db));
            db
        };
        drop(slot);
        let mut g = db.mtx.lock();
        g.holds += 1;
        drop(g);
        Ok(DbufHold::new(db, tag))
    }

    /// Start a background read of a leaf block so a future hold finds it
    /// resident.  No-op for freed, already-cached, or hole blocks.
    pub fn prefetch(self: &Arc<Self>, blkid: BlockId) {
        let topo = self.topology.read();
        if self.block_freed(blkid) {
            return;
        }
        let key = DbufKey::new(self.dataset(), self.object(), Level::LEAF, blkid);
        if self.env().index.find(&key).is_some() {
            // Already cached, or about to be read or filled.
            return;
        }
        let found = findbp(self, &topo, Level::LEAF, blkid, true);
        if let Ok((parent, slot)) = found {
            if let Some(bp) = read_slot_blkptr(&slot, self)
                && !bp.is_hole()
            {
                trace!(
                    target: "tephra::dbuf",
                    event = "prefetch",
                    key = %key,
                    addr = bp.addr.0
                );
                let _ = self.env().store.read(
                    None,
                    &bp,
                    IoPriority::Prefetch,
                    false,
                    Box::new(|_result, _buf| {}),
                );
            }
            if let Some(parent) = parent {
                rele(&parent, "parent");
            }
        }
    }
}

// --- reads: bonus, holes, completion --------------------------------------

/// Satisfy a read of the bonus region from the descriptor.  Returns whether
/// it acted.
fn read_bonus(db: &Arc<Dbuf>, g: &mut DbufInner, dn: &Dnode) -> bool {
    if !db.key.blkid.is_bonus() {
        return false;
    }
    let buf = alloc_frontend(db, g.block_size);
    let phys = dn.phys.lock();
    let n = phys.bonus.len().min(g.block_size);
    buf.with_data_mut(|data| data[..n].copy_from_slice(&phys.bonus[..n]));
    drop(phys);
    set_data(db, g, buf);
    set_state(db, g, DbufState::CACHED, "bonus buffer filled");
    true
}

/// Satisfy a read of a hole, if the pointer is one.  Returns whether it
/// acted.
///
/// For an UNCACHED dbuf the zero buffer must not be merged into older dirty
/// records (the dbuf may have been freed while older TXGs still resolve);
/// for a PARTIAL dbuf the zeros *are* the old block image and resolve
/// normally.
fn read_hole(db: &Arc<Dbuf>, g: &mut DbufInner, dn: &Dnode) -> bool {
    let uncached = g.state == DbufState::UNCACHED;
    if !uncached {
        debug_assert!(db.key.level.is_leaf());
        debug_assert!(g.state.intersects(
            DbufState::PARTIAL
                .with(DbufState::FILL)
                .with(DbufState::READ)
        ));
        debug_assert!(g.dirty_count() > 0);
    }

    let bp = db.read_blkptr_locked(g, dn);
    let mut is_hole = bp.is_none_or(|bp| bp.is_hole());
    if !is_hole && uncached && db.key.level.is_leaf() {
        // The free may not have synced out yet; recheck the freed ranges.
        // Resolving reads ignore this: older TXGs still merge against the
        // real on-disk image.
        is_hole = dn.block_freed(db.key.blkid);
    }
    if !is_hole {
        return false;
    }

    let buf = alloc_frontend(db, g.block_size);
    merge_state(db, g, DbufState::READ, "hole read satisfied");
    read_complete(db, g, buf, uncached);
    true
}

/// Store completion callback for an async read.
fn read_done(db: &Arc<Dbuf>, result: Result<()>, buf: CacheBuf) {
    let mut evictions = EvictionList::new();
    let mut g = db.mtx.lock();
    trace!(target: "tephra::dbuf", event = "read_done", key = %db.key, ok = result.is_ok());
    assert!(g.holds > 0, "read completion on an unheld dbuf");

    let mut ok = result.is_ok();
    match result {
        Ok(()) => read_complete(db, &mut g, buf, false),
        Err(err) => {
            if g.dirty_count() > 0 {
                // The read failure was reported through the pipeline; limit
                // the damage to the bytes we could not read by resolving the
                // dirty records against zeros.
                buf.freeze();
                read_complete(db, &mut g, buf, false);
                db.env
                    .counters
                    .dirty_writes_lost
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "tephra::dbuf",
                    event = "dirty_writes_lost",
                    key = %db.key,
                    error = %err
                );
                ok = true;
            } else if g.data.is_none() {
                set_state(db, &mut g, DbufState::UNCACHED, "read failed");
            } else {
                // A writer filled the block while the read was in flight;
                // the frontend stands and the failure is moot.
                debug_assert!(g.state == DbufState::CACHED || g.state == DbufState::FILL);
                ok = true;
            }
        }
    }
    let waiters = take_waiters(&mut g);
    db.changed.notify_all();
    rele_and_unlock(db, g, "read", &mut evictions);
    run_waiters(waiters, ok);
}

/// Install or resolve the freshly read block image.  Called with the dbuf
/// mutex held, in every completion path (async read, hole synthesis, cache
/// probe).
pub(crate) fn read_complete(db: &Arc<Dbuf>, g: &mut DbufInner, buf: CacheBuf, is_hole_read: bool) {
    let resolvable = db.key.level.is_leaf()
        && !is_hole_read
        && g.oldest_dirty()
            .and_then(DirtyRecord::leaf_ranges)
            .is_some_and(|ranges| !ranges.is_empty());

    if resolvable {
        resolve_ranges(db, g, &buf);

        // PARTIAL and READ are spent; a still-active filler keeps FILL and
        // performs the final transition itself.
        if g.state.contains(DbufState::FILL) {
            set_state(db, g, DbufState::FILL, "resolve with active filler");
        } else {
            set_state(db, g, DbufState::CACHED, "resolve complete");
        }

        // The read image has served its purpose; the dirty records carry
        // the merged content now.
        drop(buf);

        // Dispatch any write the syncer (or the immediate-write path)
        // parked until this resolve.
        let oldest = g
            .dirty_records
            .last_mut()
            .expect("resolvable implies a dirty record");
        if let Some(wio) = oldest.write_io.take() {
            db.env
                .counters
                .deferred_write_ios
                .fetch_add(1, Ordering::Relaxed);
            wio.dispatch();
        }
        if let Some(wio) = oldest.take_override_io() {
            db.env
                .counters
                .deferred_write_ios
                .fetch_add(1, Ordering::Relaxed);
            wio.dispatch();
        }
        db.env
            .counters
            .resolves_completed
            .fetch_add(1, Ordering::Relaxed);
    } else if g.state == DbufState::READ {
        // Read with no dirty data: the image becomes the frontend.
        set_data(db, g, buf);
        set_state(db, g, DbufState::CACHED, "read completed with no dirty records");
    } else {
        // The block was filled or freed before the read completed; the
        // frontend is already populated.
        assert!(
            g.state == DbufState::CACHED || g.state == DbufState::FILL,
            "unexpected state {:?} at read completion",
            g.state
        );
        assert!(g.state != DbufState::FILL || g.dirty_count() == 1);
        assert!(g.data.is_some());
    }
}

/// Inverse-merge the read image through the dirty-record chain, oldest to
/// newest: each record's buffer keeps its written ranges and receives the
/// older image in the holes between them.
fn resolve_ranges(db: &Arc<Dbuf>, g: &mut DbufInner, read_buf: &CacheBuf) {
    assert!(db.key.level.is_leaf());
    let frontend = g.data.clone();
    let fill_active = g.state.contains(DbufState::FILL);

    let mut old = read_buf.clone();
    let mut cleared_total = 0_i64;
    for idx in (0..g.dirty_records.len()).rev() {
        let dr = &mut g.dirty_records[idx];
        let data = dr.leaf_data().expect("leaf record carries a buffer");
        let ranges = dr.leaf_ranges().expect("leaf record carries ranges");
        if !CacheBuf::same_buf(&data, &old) {
            let max = old.len().min(data.len());
            for hole in ranges.holes(max) {
                data.copy_range_from(&old, hole.start, hole.end);
            }
        }
        // Freeze the now-complete buffer, unless a filler is actively
        // modifying the frontend; the filler freezes it when it exits.
        let is_frontend = frontend
            .as_ref()
            .is_some_and(|front| CacheBuf::same_buf(front, &data));
        if !is_frontend || !fill_active {
            data.freeze();
        }
        cleared_total += dr.clear_leaf_ranges() as i64;
        old = data;
    }
    db.env
        .counters
        .ranges_in_flight
        .fetch_sub(cleared_total, Ordering::Relaxed);
    trace!(target: "tephra::dbuf", event = "resolve", key = %db.key);

    // Now that contents are fully valid, process any split the syncer had
    // to defer until resolution.
    syncer_split(db, g, true);
}

/// Give the sync path a stable buffer: if the record being synced still
/// shares the live frontend with active holders, copy one side.
///
/// Before the write I/O exists (`deferred == false`) the syncer's record
/// takes the copy.  After a deferred resolve the write already references
/// the syncer's buffer, so the open TXG's frontend is replaced instead.
pub(crate) fn syncer_split(db: &Arc<Dbuf>, g: &mut DbufInner, deferred: bool) {
    let Some(pending_txg) = g.data_pending else {
        return;
    };
    if g.state.contains(DbufState::NOFILL) || g.holds <= 1 {
        return;
    }
    let Some(frontend) = g.data.clone() else {
        return;
    };
    let Some(idx) = g.dirty_index_for(pending_txg) else {
        return;
    };
    let Some(dr_data) = g.dirty_records[idx].leaf_data() else {
        return;
    };
    if !CacheBuf::same_buf(&dr_data, &frontend) {
        return;
    }

    let copy = alloc_frontend(db, g.block_size);
    copy.copy_from(&frontend);
    if deferred {
        set_data(db, g, copy);
    } else {
        g.dirty_records[idx].set_leaf_data(copy);
    }
    trace!(
        target: "tephra::dbuf",
        event = "syncer_split",
        key = %db.key,
        deferred
    );
}

/// Issue an asynchronous read that will eventually take this dbuf to
/// CACHED, resolving outstanding write ranges on the way.  The dbuf mutex
/// is dropped while the read is scheduled; callers must re-verify any
/// guarded state afterwards.
pub(crate) fn transition_to_read<'a>(
    db: &'a Arc<Dbuf>,
    have_struct: bool,
    g: Guard<'a>,
) -> Guard<'a> {
    assert!(
        g.state
            .intersects(DbufState::PARTIAL.with(DbufState::UNCACHED)),
        "resolving read from state {:?}",
        g.state
    );
    drop(g);

    let root = Io::root(db.env.store.executor());
    let result = db.read(
        Some(&root),
        ReadFlags {
            have_struct,
            never_wait: true,
        },
    );
    debug_assert!(result.is_ok(), "resolving read refused: {result:?}");
    db.mtx.lock()
}
