//! Striped hash index over live dbufs.
//!
//! Lookup is keyed on the `(dataset, object, level, block-id)` tuple.
//! Stripes are protected by independent mutexes; the stripe mutex is always
//! acquired before, and released after, any dbuf mutex taken on its behalf.

use crate::Dbuf;
use crate::state::DbufState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tephra_types::DbufKey;
use tracing::trace;

/// Index counters; all monotonically increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub removes: u64,
    /// Insert attempts that lost the race to an equivalent entry.
    pub race_losses: u64,
    pub entries: u64,
}

#[derive(Debug, Default)]
struct IndexCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    removes: AtomicU64,
    race_losses: AtomicU64,
    entries: AtomicU64,
}

pub(crate) struct DbufIndex {
    stripes: Vec<Mutex<Vec<Arc<Dbuf>>>>,
    mask: u64,
    counters: IndexCounters,
}

impl DbufIndex {
    /// `stripes` must be a power of two (validated by the config).
    pub(crate) fn new(stripes: usize) -> Self {
        assert!(stripes.is_power_of_two());
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(Vec::new())).collect(),
            mask: stripes as u64 - 1,
            counters: IndexCounters::default(),
        }
    }

    fn stripe(&self, key: &DbufKey) -> &Mutex<Vec<Arc<Dbuf>>> {
        &self.stripes[(key.hash64() & self.mask) as usize]
    }

    /// Look up a live entry.  Entries in EVICTING are never returned; the
    /// caller must re-verify state under the dbuf mutex and retry if it
    /// lost a teardown race after this returns.
    pub(crate) fn find(&self, key: &DbufKey) -> Option<Arc<Dbuf>> {
        let stripe = self.stripe(key).lock();
        for db in stripe.iter() {
            if db.key() == *key {
                // Stripe mutex before dbuf mutex, per the lock order.
                let inner = db.mtx.lock();
                if !inner.state.contains(DbufState::EVICTING) {
                    drop(inner);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(db));
                }
            }
        }
        drop(stripe);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Idempotent insert: if an equivalent live entry already exists, the
    /// candidate is rejected and the existing entry returned.
    pub(crate) fn insert(&self, candidate: &Arc<Dbuf>) -> Result<(), Arc<Dbuf>> {
        let key = candidate.key();
        let mut stripe = self.stripe(&key).lock();
        for db in stripe.iter() {
            if db.key() == key {
                let inner = db.mtx.lock();
                if !inner.state.contains(DbufState::EVICTING) {
                    drop(inner);
                    self.counters.race_losses.fetch_add(1, Ordering::Relaxed);
                    return Err(Arc::clone(db));
                }
            }
        }
        stripe.push(Arc::clone(candidate));
        drop(stripe);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.counters.entries.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tephra::dbuf", event = "index_insert", key = %key);
        Ok(())
    }

    /// Remove a dying entry.  The caller must have taken the dbuf to
    /// EVICTING with zero holds and must not hold its mutex.
    pub(crate) fn remove(&self, db: &Arc<Dbuf>) {
        #[cfg(debug_assertions)]
        {
            let inner = db
                .mtx
                .try_lock()
                .expect("dbuf mutex must not be held across index removal");
            assert!(inner.state.contains(DbufState::EVICTING));
            assert_eq!(inner.holds, 0);
        }
        let key = db.key();
        let mut stripe = self.stripe(&key).lock();
        let before = stripe.len();
        stripe.retain(|entry| !Arc::ptr_eq(entry, db));
        let removed = before - stripe.len();
        drop(stripe);
        assert_eq!(removed, 1, "entry missing from index: {key}");
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        self.counters.entries.fetch_sub(1, Ordering::Relaxed);
        trace!(target: "tephra::dbuf", event = "index_remove", key = %key);
    }

    pub(crate) fn metrics(&self) -> IndexMetrics {
        IndexMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            race_losses: self.counters.race_losses.load(Ordering::Relaxed),
            entries: self.counters.entries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DbufIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbufIndex")
            .field("stripes", &self.stripes.len())
            .field("entries", &self.counters.entries.load(Ordering::Relaxed))
            .finish()
    }
}
