#![forbid(unsafe_code)]
//! End-to-end scenarios for the dbuf state machine and dirty-record
//! pipeline, driven over an in-memory backend with gating and fault
//! injection.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tephra_dbuf::{
    DbufConfig, DbufEnv, DbufState, DbufUser, Dnode, DnodeSpec, ReadFlags, Tx,
};
use tephra_error::{Result, TephraError};
use tephra_store::{ArcStore, MemBackend, StorageBackend, StoreConfig};
use tephra_types::{BlockAddr, BlockId, BlockSize, DatasetId, Level, ObjectId, TxgId};

const BLOCK_SIZE: usize = 4096;

/// Backend wrapper that can stall or fail reads and stall writes.
#[derive(Debug)]
struct GateBackend {
    inner: MemBackend,
    reads_gated: Mutex<bool>,
    writes_gated: Mutex<bool>,
    read_gate: Condvar,
    write_gate: Condvar,
    fail_reads: AtomicBool,
}

impl GateBackend {
    fn new() -> Self {
        Self {
            inner: MemBackend::new(),
            reads_gated: Mutex::new(false),
            writes_gated: Mutex::new(false),
            read_gate: Condvar::new(),
            write_gate: Condvar::new(),
            fail_reads: AtomicBool::new(false),
        }
    }

    fn gate_reads(&self, gated: bool) {
        *self.reads_gated.lock() = gated;
        self.read_gate.notify_all();
    }

    fn gate_writes(&self, gated: bool) {
        *self.writes_gated.lock() = gated;
        self.write_gate.notify_all();
    }

    fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl StorageBackend for GateBackend {
    fn read_at(&self, addr: BlockAddr, buf: &mut [u8]) -> Result<()> {
        let mut gated = self.reads_gated.lock();
        while *gated {
            self.read_gate.wait(&mut gated);
        }
        drop(gated);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TephraError::ReadFailed);
        }
        self.inner.read_at(addr, buf)
    }

    fn write_at(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        let mut gated = self.writes_gated.lock();
        while *gated {
            self.write_gate.wait(&mut gated);
        }
        drop(gated);
        self.inner.write_at(addr, data)
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

struct Rig {
    backend: Arc<GateBackend>,
    env: Arc<DbufEnv>,
    dn: Arc<Dnode>,
}

fn rig_with_levels(nlevels: u8) -> Rig {
    let backend = Arc::new(GateBackend::new());
    let store = ArcStore::new(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        StoreConfig::default(),
    )
    .unwrap();
    let env = DbufEnv::new(store, DbufConfig::default()).unwrap();
    let dn = Dnode::new(
        Arc::clone(&env),
        DatasetId(1),
        ObjectId(42),
        DnodeSpec {
            block_size: BlockSize::new(BLOCK_SIZE as u32).unwrap(),
            nlevels,
            indblkshift: 10,
            nblkptr: 1,
            bonus_len: 64,
        },
    )
    .unwrap();
    Rig { backend, env, dn }
}

fn rig() -> Rig {
    rig_with_levels(1)
}

fn sync_txg(dn: &Arc<Dnode>, txg: u64) {
    dn.sync(&Tx::syncing(TxgId(txg))).wait().unwrap();
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Read the bytes a block pointer names, straight through the store.
fn read_bp_bytes(env: &Arc<DbufEnv>, bp: tephra_types::BlockPtr) -> Vec<u8> {
    let (tx, rx) = std::sync::mpsc::channel();
    env.store().read(
        None,
        &bp,
        tephra_store::IoPriority::SyncRead,
        false,
        Box::new(move |result, buf| {
            result.unwrap();
            tx.send(buf.with_data(<[u8]>::to_vec)).unwrap();
        }),
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn hole_read_yields_zeros() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let outcome = hold.read(None, ReadFlags::default()).unwrap();
    assert!(outcome.cached);
    assert_eq!(hold.state(), DbufState::CACHED);
    assert!(
        hold.with_frontend(|data| data.iter().all(|b| *b == 0))
            .unwrap()
    );
}

#[test]
fn fail_sparse_hold_of_a_hole_is_enoent() {
    let r = rig();
    let err = r
        .dn
        .hold_fail_sparse(Level::LEAF, BlockId(0), "test")
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn nofill_buffer_rejects_reads() {
    let r = rig();
    let tx = Tx::new(TxgId(1));
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.will_not_fill(&tx).unwrap();
    let err = hold.read(None, ReadFlags::default()).unwrap_err();
    assert!(matches!(err, TephraError::NoData));
    assert_eq!(err.to_errno(), libc::EIO);
    sync_txg(&r.dn, 1);
}

#[test]
fn full_block_write_skips_partial() {
    let r = rig();
    let tx = Tx::new(TxgId(1));
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.will_fill(&tx).unwrap();
    // A write covering the whole block goes straight to FILL.
    assert_eq!(hold.state(), DbufState::FILL);
    hold.with_frontend_mut(|data| data.fill(0xAA)).unwrap();
    hold.fill_done(&tx);
    assert_eq!(hold.state(), DbufState::CACHED);
    assert_eq!(hold.dirty_count(), 1);

    sync_txg(&r.dn, 1);
    assert_eq!(hold.dirty_count(), 0);
    let bp = hold.blkptr().unwrap();
    assert!(!bp.is_hole());
    assert_eq!(bp.birth_txg, TxgId(1));
    assert!(read_bp_bytes(&r.env, bp).iter().all(|b| *b == 0xAA));
}

#[test]
fn prefix_write_on_a_cold_block_goes_partial() {
    let r = rig();
    let tx = Tx::new(TxgId(1));
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.will_dirty_range(&tx, 0, 512).unwrap();
    assert_eq!(hold.state(), DbufState::PARTIAL.with(DbufState::FILL));
    assert_eq!(
        hold.dirty_ranges(TxgId(1))
            .unwrap()
            .iter()
            .map(|range| (range.start, range.end))
            .collect::<Vec<_>>(),
        vec![(0, 512)]
    );
    hold.with_frontend_mut(|data| data[..512].fill(0xCC)).unwrap();
    hold.fill_done(&tx);
    assert_eq!(hold.state(), DbufState::PARTIAL);
}

#[test]
fn two_txg_overwrite_preserves_older_content() {
    let r = rig_with_levels(2);
    let hold = r.dn.hold_block(BlockId(7), "test").unwrap();

    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xAA)).unwrap();
    hold.fill_done(&tx1);

    let tx2 = Tx::new(TxgId(2));
    hold.will_dirty_range(&tx2, 100, 100).unwrap();
    hold.with_frontend_mut(|data| data[100..200].fill(0xBB))
        .unwrap();

    // Two records, strictly TXG-ordered; the older one kept its own copy.
    assert_eq!(hold.dirty_count(), 2);
    assert!(
        hold.with_dirty_data(TxgId(1), |data| data.iter().all(|b| *b == 0xAA))
            .unwrap()
    );
    // The buffer was already fully cached, so no RMW bookkeeping exists.
    assert!(hold.dirty_ranges(TxgId(2)).unwrap().is_empty());

    sync_txg(&r.dn, 1);
    let bp1 = hold.blkptr().unwrap();
    assert!(read_bp_bytes(&r.env, bp1).iter().all(|b| *b == 0xAA));

    // The TXG 2 buffer began as a clone of TXG 1 and carries the patch.
    let patched = hold
        .with_dirty_data(TxgId(2), |data| {
            data.iter()
                .enumerate()
                .all(|(i, b)| if (100..200).contains(&i) { *b == 0xBB } else { *b == 0xAA })
        })
        .unwrap();
    assert!(patched);

    sync_txg(&r.dn, 2);
    let bp2 = hold.blkptr().unwrap();
    assert_ne!(bp1.addr, bp2.addr, "copy-on-write allocates fresh storage");
    let bytes = read_bp_bytes(&r.env, bp2);
    assert!(bytes[..100].iter().all(|b| *b == 0xAA));
    assert!(bytes[100..200].iter().all(|b| *b == 0xBB));
    assert!(bytes[200..].iter().all(|b| *b == 0xAA));
}

#[test]
fn suffix_write_resolves_against_disk_at_sync() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();

    // Put 0xDD on disk, then push the dbuf out of memory entirely.
    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xDD)).unwrap();
    hold.fill_done(&tx1);
    sync_txg(&r.dn, 1);
    let bp1 = hold.blkptr().unwrap();
    hold.release();
    r.env.store().evict_addr(bp1.addr);
    // The frontend was anonymous after the dirty, so release destroyed the
    // dbuf; a fresh hold starts UNCACHED.
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    assert_eq!(hold.state(), DbufState::UNCACHED);

    // Suffix write: no resolving read is triggered up front.
    let tx2 = Tx::new(TxgId(2));
    hold.will_dirty_range(&tx2, 1024, BLOCK_SIZE - 1024).unwrap();
    assert_eq!(hold.state(), DbufState::PARTIAL.with(DbufState::FILL));
    hold.with_frontend_mut(|data| data[1024..].fill(0xCC)).unwrap();
    hold.fill_done(&tx2);
    assert_eq!(hold.state(), DbufState::PARTIAL);

    // The syncer forces the resolve; the parked write is dispatched once
    // the read merges the on-disk prefix.
    sync_txg(&r.dn, 2);
    let metrics = r.env.metrics();
    assert_eq!(metrics.resolves_completed, 1);
    assert_eq!(metrics.deferred_resolves, metrics.deferred_write_ios);
    assert_eq!(hold.state(), DbufState::CACHED);
    assert!(hold.dirty_ranges(TxgId(2)).is_none());

    let bytes = read_bp_bytes(&r.env, hold.blkptr().unwrap());
    assert!(bytes[..1024].iter().all(|b| *b == 0xDD));
    assert!(bytes[1024..].iter().all(|b| *b == 0xCC));
}

#[test]
fn interior_write_starts_resolving_read_immediately() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();

    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xDD)).unwrap();
    hold.fill_done(&tx1);
    sync_txg(&r.dn, 1);
    let bp1 = hold.blkptr().unwrap();
    hold.release();
    r.env.store().evict_addr(bp1.addr);
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();

    // Stall the backing read so the in-flight composite is observable.
    r.backend.gate_reads(true);
    let tx2 = Tx::new(TxgId(2));
    hold.will_dirty_range(&tx2, 1024, 1024).unwrap();
    let state = hold.state();
    assert!(state.contains(DbufState::FILL));
    assert!(state.contains(DbufState::READ));
    let reads_before = r.env.store().metrics().reads_issued;
    assert_eq!(reads_before, 1, "interior write issues the read up front");

    hold.with_frontend_mut(|data| data[1024..2048].fill(0xCC))
        .unwrap();
    r.backend.gate_reads(false);
    wait_until("resolve", || !hold.state().contains(DbufState::READ));
    hold.fill_done(&tx2);
    assert_eq!(hold.state(), DbufState::CACHED);

    let ok = hold
        .with_frontend(|data| {
            data.iter().enumerate().all(|(i, b)| {
                if (1024..2048).contains(&i) {
                    *b == 0xCC
                } else {
                    *b == 0xDD
                }
            })
        })
        .unwrap();
    assert!(ok);
    sync_txg(&r.dn, 2);
}

#[test]
fn shrinking_write_takes_resident_copy_from_cache_probe() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();

    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xDD)).unwrap();
    hold.fill_done(&tx1);
    sync_txg(&r.dn, 1);
    let bp1 = hold.blkptr().unwrap();
    // The dirtied frontend was anonymous, so this release destroys the
    // dbuf; the content survives on disk and (after the read below) in
    // the resident cache.
    hold.release();
    let _ = read_bp_bytes(&r.env, bp1);

    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    assert_eq!(hold.state(), DbufState::UNCACHED);

    let reads_before = r.env.store().metrics().reads_issued;
    let tx2 = Tx::new(TxgId(2));
    hold.will_dirty_range(&tx2, 0, 512).unwrap();
    // The probe found the resident copy: no PARTIAL, no new backend read.
    assert_eq!(r.env.store().metrics().reads_issued, reads_before);
    assert!(!hold.state().contains(DbufState::PARTIAL));
    hold.with_frontend_mut(|data| data[..512].fill(0xCC)).unwrap();
    hold.fill_done(&tx2);
    sync_txg(&r.dn, 2);

    let bytes = read_bp_bytes(&r.env, hold.blkptr().unwrap());
    assert!(bytes[..512].iter().all(|b| *b == 0xCC));
    assert!(bytes[512..].iter().all(|b| *b == 0xDD));
}

#[test]
fn free_range_races_filler_and_filler_zeroes() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx = Tx::new(TxgId(1));
    hold.will_dirty_range(&tx, 0, 512).unwrap();
    assert!(hold.state().contains(DbufState::FILL));
    hold.with_frontend_mut(|data| data[..512].fill(0xEE)).unwrap();

    // The free arrives while the filler owns the frontend.
    r.dn.free_range(BlockId(0), BlockId(0), &tx).unwrap();
    assert!(hold.state().contains(DbufState::FILL));

    hold.fill_done(&tx);
    assert_eq!(hold.state(), DbufState::CACHED);
    assert!(
        hold.with_frontend(|data| data.iter().all(|b| *b == 0))
            .unwrap()
    );
    assert!(hold.dirty_ranges(TxgId(1)).unwrap().is_empty());
    sync_txg(&r.dn, 1);
}

#[test]
fn free_range_after_pending_dirty_preserves_older_record() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();

    let tx1 = Tx::new(TxgId(1));
    hold.will_dirty_range(&tx1, 0, 512).unwrap();
    hold.with_frontend_mut(|data| data[..512].fill(0xCC)).unwrap();
    hold.fill_done(&tx1);
    assert_eq!(hold.state(), DbufState::PARTIAL);

    let tx2 = Tx::new(TxgId(2));
    r.dn.free_range(BlockId(0), BlockId(0), &tx2).unwrap();

    // The current view is zeroed and fully cached.
    assert_eq!(hold.state(), DbufState::CACHED);
    assert!(
        hold.with_frontend(|data| data.iter().all(|b| *b == 0))
            .unwrap()
    );
    // The older TXG still carries its resolved content.
    assert_eq!(hold.dirty_count(), 1);
    let older_ok = hold
        .with_dirty_data(TxgId(1), |data| {
            data[..512].iter().all(|b| *b == 0xCC) && data[512..].iter().all(|b| *b == 0)
        })
        .unwrap();
    assert!(older_ok);

    sync_txg(&r.dn, 1);
    let bytes = read_bp_bytes(&r.env, hold.blkptr().unwrap());
    assert!(bytes[..512].iter().all(|b| *b == 0xCC));
}

#[test]
fn cow_split_protects_the_syncing_buffer() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xAA)).unwrap();
    hold.fill_done(&tx1);
    hold.release();

    // Start the sync but stall the write so the record stays pending.
    r.backend.gate_writes(true);
    let root = r.dn.sync(&Tx::syncing(TxgId(1)));
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    wait_until("data_pending", || hold.pending_txg() == Some(TxgId(1)));

    // A new writer for TXG 2 must not leak into the in-flight write.
    let tx2 = Tx::new(TxgId(2));
    hold.will_fill(&tx2).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xBB)).unwrap();
    hold.fill_done(&tx2);
    assert!(
        hold.with_dirty_data(TxgId(1), |data| data.iter().all(|b| *b == 0xAA))
            .unwrap(),
        "the pending record still references the original content"
    );

    r.backend.gate_writes(false);
    root.wait().unwrap();
    let bytes = read_bp_bytes(&r.env, hold.blkptr().unwrap());
    assert!(bytes.iter().all(|b| *b == 0xAA));

    sync_txg(&r.dn, 2);
    let bytes = read_bp_bytes(&r.env, hold.blkptr().unwrap());
    assert!(bytes.iter().all(|b| *b == 0xBB));
}

#[test]
fn read_failure_with_dirty_content_zero_fills_and_counts() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0xDD)).unwrap();
    hold.fill_done(&tx1);
    sync_txg(&r.dn, 1);
    let bp1 = hold.blkptr().unwrap();
    hold.release();
    r.env.store().evict_addr(bp1.addr);

    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx2 = Tx::new(TxgId(2));
    hold.will_dirty_range(&tx2, 2048, 2048).unwrap();
    hold.with_frontend_mut(|data| data[2048..].fill(0xCC)).unwrap();
    hold.fill_done(&tx2);
    assert_eq!(hold.state(), DbufState::PARTIAL);

    // The resolving read fails; the layer limits the damage to zeros.
    r.backend.fail_reads(true);
    sync_txg(&r.dn, 2);
    r.backend.fail_reads(false);

    assert_eq!(r.env.metrics().dirty_writes_lost, 1);
    assert_eq!(hold.state(), DbufState::CACHED);
    let bytes = read_bp_bytes(&r.env, hold.blkptr().unwrap());
    assert!(bytes[..2048].iter().all(|b| *b == 0));
    assert!(bytes[2048..].iter().all(|b| *b == 0xCC));
}

#[test]
fn clean_read_failure_returns_to_uncached() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx1 = Tx::new(TxgId(1));
    hold.will_fill(&tx1).unwrap();
    hold.with_frontend_mut(|data| data.fill(0x11)).unwrap();
    hold.fill_done(&tx1);
    sync_txg(&r.dn, 1);
    let bp = hold.blkptr().unwrap();
    hold.release();
    r.env.store().evict_addr(bp.addr);

    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    r.backend.fail_reads(true);
    let err = hold.read(None, ReadFlags::default()).unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);
    assert_eq!(hold.state(), DbufState::UNCACHED);
    r.backend.fail_reads(false);

    // The block is still intact underneath.
    let outcome = hold.read(None, ReadFlags::default()).unwrap();
    assert!(!outcome.cached || hold.state() == DbufState::CACHED);
    wait_until("re-read", || hold.state() == DbufState::CACHED);
    assert!(
        hold.with_frontend(|data| data.iter().all(|b| *b == 0x11))
            .unwrap()
    );
}

/// Seed block 0 with `byte` on disk and return a fresh hold whose frontend
/// came through the backend (a resident, non-anonymous buffer).
fn seeded_resident_hold(r: &Rig, byte: u8) -> tephra_dbuf::DbufHold {
    let hold = r.dn.hold_block(BlockId(0), "seed").unwrap();
    let tx = Tx::new(TxgId(1));
    hold.will_fill(&tx).unwrap();
    hold.with_frontend_mut(|data| data.fill(byte)).unwrap();
    hold.fill_done(&tx);
    sync_txg(&r.dn, 1);
    hold.release();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.read(None, ReadFlags::default()).unwrap();
    assert_eq!(hold.state(), DbufState::CACHED);
    hold
}

#[test]
fn hold_rele_keeps_cacheable_blocks_warm() {
    let r = rig();
    let hold = seeded_resident_hold(&r, 0x33);
    hold.release();

    // Re-holding finds the same cached content without touching the
    // backend.
    let reads_before = r.env.store().metrics().reads_issued;
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    assert_eq!(hold.state(), DbufState::CACHED);
    let outcome = hold.read(None, ReadFlags::default()).unwrap();
    assert!(outcome.cached);
    assert_eq!(r.env.store().metrics().reads_issued, reads_before);
    assert!(
        hold.with_frontend(|data| data.iter().all(|b| *b == 0x33))
            .unwrap()
    );
}

#[test]
fn uncacheable_blocks_are_destroyed_on_last_release() {
    let r = rig();
    let hold = seeded_resident_hold(&r, 0x44);

    r.dn.set_cacheable(false);
    hold.release();
    r.dn.set_cacheable(true);

    // A fresh hold starts over from UNCACHED.
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    assert_eq!(hold.state(), DbufState::UNCACHED);
}

#[test]
fn invalidated_buffer_is_detected_on_next_hold() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx = Tx::new(TxgId(1));
    hold.will_fill(&tx).unwrap();
    hold.with_frontend_mut(|data| data.fill(0x55)).unwrap();
    hold.fill_done(&tx);
    sync_txg(&r.dn, 1);
    hold.release();

    // Pull the resident copy out from underneath the warm dbuf.
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let bp = hold.blkptr().unwrap();
    // Re-read so the frontend is a resident (non-anonymous) buffer.
    drop(hold);
    let _ = read_bp_bytes(&r.env, bp);
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.read(None, ReadFlags::default()).unwrap();
    wait_until("cached", || hold.state() == DbufState::CACHED);
    hold.release();
    r.env.store().evict_addr(bp.addr);

    // The warm dbuf either tore down via the eviction callback or the
    // next hold notices the invalidated buffer; both end in a usable
    // fresh read.
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.read(None, ReadFlags::default()).unwrap();
    wait_until("re-read after invalidation", || {
        hold.state() == DbufState::CACHED
    });
    assert!(
        hold.with_frontend(|data| data.iter().all(|b| *b == 0x55))
            .unwrap()
    );
}

#[test]
fn concurrent_reader_waits_out_inflight_read() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let tx = Tx::new(TxgId(1));
    hold.will_fill(&tx).unwrap();
    hold.with_frontend_mut(|data| data.fill(0x77)).unwrap();
    hold.fill_done(&tx);
    sync_txg(&r.dn, 1);
    let bp = hold.blkptr().unwrap();
    hold.release();
    r.env.store().evict_addr(bp.addr);

    r.backend.gate_reads(true);
    let dn = Arc::clone(&r.dn);
    let first = std::thread::spawn(move || {
        let hold = dn.hold_block(BlockId(0), "reader-a").unwrap();
        hold.read(None, ReadFlags::default()).unwrap();
        hold.with_frontend(|data| data[0]).unwrap()
    });

    let hold = r.dn.hold_block(BlockId(0), "reader-b").unwrap();
    wait_until("read in flight", || {
        hold.state().contains(DbufState::READ)
    });
    // NEVERWAIT returns immediately while the read is still in flight.
    let outcome = hold
        .read(
            None,
            ReadFlags {
                never_wait: true,
                ..ReadFlags::default()
            },
        )
        .unwrap();
    assert!(!outcome.cached);
    assert!(hold.state().contains(DbufState::READ));

    r.backend.gate_reads(false);
    // The blocking variant waits for the first reader's completion.
    hold.read(None, ReadFlags::default()).unwrap();
    assert_eq!(hold.state(), DbufState::CACHED);
    assert_eq!(first.join().unwrap(), 0x77);
}

struct Probe {
    evictions: AtomicUsize,
}

impl DbufUser for Probe {
    fn evicted(self: Arc<Self>) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }
}

fn probe() -> Arc<Probe> {
    Arc::new(Probe {
        evictions: AtomicUsize::new(0),
    })
}

#[test]
fn user_record_laws() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.read(None, ReadFlags::default()).unwrap();

    let x_dyn: Arc<dyn DbufUser> = probe();
    let y_dyn: Arc<dyn DbufUser> = probe();

    assert!(hold.set_user(Arc::clone(&x_dyn)).is_none());
    assert!(Arc::ptr_eq(&hold.get_user().unwrap(), &x_dyn));
    // A second install is refused and reports the occupant.
    assert!(hold.set_user(Arc::clone(&y_dyn)).is_some());

    // Removing the wrong user is a no-op that returns nothing.
    assert!(hold.remove_user(&y_dyn).is_none());
    assert!(Arc::ptr_eq(&hold.get_user().unwrap(), &x_dyn));
    // Removing the right user returns it.
    assert!(Arc::ptr_eq(&hold.remove_user(&x_dyn).unwrap(), &x_dyn));
    assert!(hold.get_user().is_none());

    // replace_user swaps only when the expectation matches.
    assert!(hold.replace_user(None, Some(Arc::clone(&x_dyn))).is_none());
    let displaced = hold
        .replace_user(Some(&x_dyn), Some(Arc::clone(&y_dyn)))
        .unwrap();
    assert!(Arc::ptr_eq(&displaced, &x_dyn));
    let blocked = hold.replace_user(Some(&x_dyn), None).unwrap();
    assert!(Arc::ptr_eq(&blocked, &y_dyn));
}

#[test]
fn user_eviction_runs_outside_the_mutex_on_teardown() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    hold.read(None, ReadFlags::default()).unwrap();
    let user = probe();
    let installed: Arc<dyn DbufUser> = user.clone();
    assert!(hold.set_user_immediate_evict(installed).is_none());
    assert_eq!(user.evictions.load(Ordering::SeqCst), 0);
    hold.release();
    assert_eq!(user.evictions.load(Ordering::SeqCst), 1);
    assert_eq!(r.env.metrics().user_evicts, 1);
}

#[test]
fn spill_size_on_ordinary_block_is_enotsup() {
    let r = rig();
    let hold = r.dn.hold_block(BlockId(0), "test").unwrap();
    let err = hold.spill_set_blksz(2048, &Tx::new(TxgId(1))).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTSUP);
}
