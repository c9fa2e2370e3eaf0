//! Object-descriptor collaborator.
//!
//! The buffer cache consumes a narrow slice of the object layer: topology
//! (levels and block sizes) stabilized by a read-write lock, the physical
//! root block pointers plus bonus/spill regions, the per-object list of
//! live dbufs, per-TXG dirty lists, and freed-range bookkeeping consulted
//! by hole reads.
//!
//! Lock order, top-down: topology rwlock > dbufs mutex > hash stripe >
//! parent record mutex > dbuf mutex > phys/freed mutexes.

use crate::{Dbuf, DbufEnv, DbufHold};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tephra_error::{Result, TephraError};
use tephra_types::{
    BLKPTR_SHIFT, BlockId, BlockPtr, BlockSize, DatasetId, Level, ObjectId, TXG_SIZE, TxgId,
};
use tracing::trace;

/// Transaction handle: the slice of the transaction layer this crate
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tx {
    txg: TxgId,
    syncing: bool,
}

impl Tx {
    #[must_use]
    pub fn new(txg: TxgId) -> Self {
        Self {
            txg,
            syncing: false,
        }
    }

    /// A handle for the dedicated syncing context of `txg`.
    #[must_use]
    pub fn syncing(txg: TxgId) -> Self {
        Self { txg, syncing: true }
    }

    #[must_use]
    pub fn txg(&self) -> TxgId {
        self.txg
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.syncing
    }
}

/// Indirection geometry of an object.  Guarded by the struct rwlock so
/// holds see a stable `(nlevels, block sizes)` while walking parents.
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    pub nlevels: u8,
    pub datablksz: u32,
    pub indblkshift: u32,
    /// Root block-pointer slots embedded in the descriptor.
    pub nblkptr: usize,
}

impl Topology {
    /// Bits of block-id consumed per indirection level.
    #[must_use]
    pub fn epbs(&self) -> u32 {
        self.indblkshift - BLKPTR_SHIFT
    }

    #[must_use]
    pub fn block_size(&self, level: Level) -> usize {
        if level.is_leaf() {
            self.datablksz as usize
        } else {
            1 << self.indblkshift
        }
    }
}

/// Physical descriptor state: root pointers and the embedded regions.
#[derive(Debug)]
pub(crate) struct DnodePhys {
    pub blkptr: Vec<BlockPtr>,
    pub spill: Option<BlockPtr>,
    pub bonus: Vec<u8>,
    pub maxblkid: u64,
    pub have_spill: bool,
}

/// Construction parameters for an object descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DnodeSpec {
    pub block_size: BlockSize,
    pub nlevels: u8,
    pub indblkshift: u32,
    pub nblkptr: usize,
    pub bonus_len: usize,
}

impl DnodeSpec {
    pub fn validate(self) -> Result<Self> {
        if self.nlevels == 0 {
            return Err(TephraError::Format("nlevels must be at least 1".to_owned()));
        }
        if self.indblkshift <= BLKPTR_SHIFT || self.indblkshift > 17 {
            return Err(TephraError::Format(format!(
                "indblkshift {} out of range ({}..=17)",
                self.indblkshift,
                BLKPTR_SHIFT + 1
            )));
        }
        if self.nblkptr == 0 || self.nblkptr > 3 {
            return Err(TephraError::Format(
                "nblkptr must be in 1..=3".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// One object descriptor.
pub struct Dnode {
    env: Arc<DbufEnv>,
    dataset: DatasetId,
    object: ObjectId,
    pub(crate) topology: RwLock<Topology>,
    pub(crate) phys: Mutex<DnodePhys>,
    /// Every live ordinary/spill dbuf of this object.  Held across hash
    /// insertion so a concurrent lookup cannot observe a half-created dbuf.
    pub(crate) dbufs: Mutex<Vec<Arc<Dbuf>>>,
    /// The bonus dbuf lives outside the hash table and the dbuf list.
    pub(crate) bonus_dbuf: Mutex<Option<Arc<Dbuf>>>,
    dirty: [Mutex<Vec<Arc<Dbuf>>>; TXG_SIZE],
    /// Inclusive freed block-id ranges per open TXG slot.
    freed: [Mutex<Vec<(u64, u64)>>; TXG_SIZE],
    bonus_len: usize,
    space_delta: AtomicI64,
    cacheable: AtomicBool,
}

impl std::fmt::Debug for Dnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dnode")
            .field("dataset", &self.dataset)
            .field("object", &self.object)
            .field("dbufs", &self.dbufs.lock().len())
            .finish()
    }
}

impl Dnode {
    pub fn new(
        env: Arc<DbufEnv>,
        dataset: DatasetId,
        object: ObjectId,
        spec: DnodeSpec,
    ) -> Result<Arc<Self>> {
        let spec = spec.validate()?;
        Ok(Arc::new(Self {
            env,
            dataset,
            object,
            topology: RwLock::new(Topology {
                nlevels: spec.nlevels,
                datablksz: spec.block_size.get(),
                indblkshift: spec.indblkshift,
                nblkptr: spec.nblkptr,
            }),
            phys: Mutex::new(DnodePhys {
                blkptr: vec![BlockPtr::hole(); spec.nblkptr],
                spill: None,
                bonus: vec![0_u8; spec.bonus_len],
                maxblkid: 0,
                have_spill: false,
            }),
            dbufs: Mutex::new(Vec::new()),
            bonus_dbuf: Mutex::new(None),
            dirty: std::array::from_fn(|_| Mutex::new(Vec::new())),
            freed: std::array::from_fn(|_| Mutex::new(Vec::new())),
            bonus_len: spec.bonus_len,
            space_delta: AtomicI64::new(0),
            cacheable: AtomicBool::new(true),
        }))
    }

    #[must_use]
    pub fn env(&self) -> &Arc<DbufEnv> {
        &self.env
    }

    #[must_use]
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    #[must_use]
    pub fn object(&self) -> ObjectId {
        self.object
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.object.is_meta()
    }

    #[must_use]
    pub fn bonus_len(&self) -> usize {
        self.bonus_len
    }

    /// Whether released buffers of this object stay warm in the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cacheable.load(Ordering::Acquire)
    }

    pub fn set_cacheable(&self, cacheable: bool) {
        self.cacheable.store(cacheable, Ordering::Release);
    }

    /// Hold a leaf data block.
    pub fn hold_block(self: &Arc<Self>, blkid: BlockId, tag: &'static str) -> Result<DbufHold> {
        self.hold_level(Level::LEAF, blkid, tag)
    }

    pub fn hold_level(
        self: &Arc<Self>,
        level: Level,
        blkid: BlockId,
        tag: &'static str,
    ) -> Result<DbufHold> {
        let topology = self.topology.read();
        let db = crate::hold_impl(self, &topology, level, blkid, false, tag)?;
        drop(topology);
        Ok(DbufHold::new(db, tag))
    }

    /// Hold with sparse-failure semantics: holding a hole yields `NotFound`.
    pub fn hold_fail_sparse(
        self: &Arc<Self>,
        level: Level,
        blkid: BlockId,
        tag: &'static str,
    ) -> Result<DbufHold> {
        let topology = self.topology.read();
        let db = crate::hold_impl(self, &topology, level, blkid, true, tag)?;
        drop(topology);
        Ok(DbufHold::new(db, tag))
    }

    /// Record that a block id now carries data, extending the object's
    /// logical extent.
    pub(crate) fn new_blkid(&self, blkid: BlockId) {
        if !blkid.is_ordinary() {
            return;
        }
        let mut phys = self.phys.lock();
        if blkid.0 > phys.maxblkid {
            phys.maxblkid = blkid.0;
        }
    }

    /// Free-accounting hook: `delta` bytes will be consumed (or returned,
    /// when negative) by the currently dirtied state.
    pub(crate) fn willuse_space(&self, delta: i64) {
        self.space_delta.fetch_add(delta, Ordering::Relaxed);
    }

    /// Net bytes of accounting recorded so far (test observability).
    #[must_use]
    pub fn space_delta(&self) -> i64 {
        self.space_delta.load(Ordering::Relaxed)
    }

    pub(crate) fn push_dirty(&self, txg: TxgId, db: Arc<Dbuf>) {
        let mut list = self.dirty[txg.slot()].lock();
        debug_assert!(!list.iter().any(|d| Arc::ptr_eq(d, &db)));
        list.push(db);
    }

    pub(crate) fn remove_dirty(&self, txg: TxgId, db: &Arc<Dbuf>) {
        self.dirty[txg.slot()].lock().retain(|d| !Arc::ptr_eq(d, db));
    }

    pub(crate) fn take_dirty(&self, txg: TxgId) -> Vec<Arc<Dbuf>> {
        std::mem::take(&mut *self.dirty[txg.slot()].lock())
    }

    #[must_use]
    pub fn has_dirty(&self, txg: TxgId) -> bool {
        !self.dirty[txg.slot()].lock().is_empty()
    }

    /// Mark the object dirty in its dataset for `txg`.  Dataset-level
    /// bookkeeping is outside this layer; the event is traced so the
    /// embedding object layer can observe the protocol.
    pub(crate) fn setdirty(&self, txg: TxgId) {
        trace!(
            target: "tephra::dbuf",
            event = "dnode_setdirty",
            object = self.object.0,
            txg = txg.0
        );
    }

    /// Record `[start, end]` (inclusive) as freed in `txg`.
    pub(crate) fn add_freed(&self, start: u64, end: u64, txg: TxgId) {
        self.freed[txg.slot()].lock().push((start, end));
    }

    /// Was `blkid` freed in any open TXG?  Consulted by hole reads to
    /// catch pointers whose free has not yet synced out.
    #[must_use]
    pub(crate) fn block_freed(&self, blkid: BlockId) -> bool {
        if !blkid.is_ordinary() {
            return false;
        }
        self.freed
            .iter()
            .any(|slot| slot.lock().iter().any(|(s, e)| (*s..=*e).contains(&blkid.0)))
    }

    /// Revert a pending free of `blkid` in `txg`: the block was re-dirtied.
    pub(crate) fn clear_freed(&self, blkid: BlockId, txg: TxgId) {
        if !blkid.is_ordinary() {
            return;
        }
        let mut slot = self.freed[txg.slot()].lock();
        let mut split = Vec::new();
        slot.retain_mut(|(s, e)| {
            if !(*s..=*e).contains(&blkid.0) {
                return true;
            }
            if *s < blkid.0 {
                if *e > blkid.0 {
                    split.push((blkid.0 + 1, *e));
                }
                *e = blkid.0 - 1;
                true
            } else if *e > blkid.0 {
                *s = blkid.0 + 1;
                true
            } else {
                false
            }
        });
        slot.extend(split);
    }

    /// Drop the freed-range bookkeeping for a TXG once it has synced.
    pub(crate) fn clear_freed_txg(&self, txg: TxgId) {
        self.freed[txg.slot()].lock().clear();
    }

    pub(crate) fn remove_dbuf(&self, db: &Arc<Dbuf>) {
        self.dbufs.lock().retain(|entry| !Arc::ptr_eq(entry, db));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_validation_bounds() {
        let good = DnodeSpec {
            block_size: BlockSize::new(4096).unwrap(),
            nlevels: 2,
            indblkshift: 10,
            nblkptr: 1,
            bonus_len: 64,
        };
        assert!(good.validate().is_ok());
        assert!(DnodeSpec { nlevels: 0, ..good }.validate().is_err());
        assert!(
            DnodeSpec {
                indblkshift: BLKPTR_SHIFT,
                ..good
            }
            .validate()
            .is_err()
        );
        assert!(DnodeSpec { nblkptr: 4, ..good }.validate().is_err());
    }

    #[test]
    fn freed_range_bookkeeping() {
        let env = crate::DbufEnv::new_in_memory_for_tests();
        let dn = Dnode::new(
            env,
            DatasetId(1),
            ObjectId(5),
            DnodeSpec {
                block_size: BlockSize::new(4096).unwrap(),
                nlevels: 1,
                indblkshift: 10,
                nblkptr: 1,
                bonus_len: 0,
            },
        )
        .unwrap();
        let txg = TxgId(3);
        dn.add_freed(10, 20, txg);
        assert!(dn.block_freed(BlockId(10)));
        assert!(dn.block_freed(BlockId(20)));
        assert!(!dn.block_freed(BlockId(21)));

        dn.clear_freed(BlockId(15), txg);
        assert!(dn.block_freed(BlockId(14)));
        assert!(!dn.block_freed(BlockId(15)));
        assert!(dn.block_freed(BlockId(16)));

        dn.clear_freed_txg(txg);
        assert!(!dn.block_freed(BlockId(14)));
    }
}
