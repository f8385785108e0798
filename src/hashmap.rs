//! Lock-free open-addressed map from feature id to slot handle.
//!
//! Linear probing over `(AtomicI64 key, AtomicPtr value)` cells. Lookups
//! are wait-free: they load the current table through an `ArcSwap` and
//! probe without ever writing. Writers CAS-publish the key first, then
//! the value pointer; a cell with a claimed key and a null value is an
//! insert in flight. Removal nulls the value, then tombstones the key.
//!
//! Resize doubles the table under a writer-freeze lock: every mutating
//! call holds the lock shared, the resizer holds it exclusively, rehashes
//! live cells (dropping tombstones) and publishes the new table. Readers
//! in flight keep probing their snapshot and are never blocked.

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::slot::{SlotHandle, ValueSlot};

/// Reserved: marks a never-used cell.
pub const EMPTY_KEY: i64 = i64::MIN;
/// Reserved: marks a removed cell, reclaimed on resize.
pub const TOMBSTONE_KEY: i64 = i64::MIN + 1;

pub fn is_reserved_key(key: i64) -> bool {
    key == EMPTY_KEY || key == TOMBSTONE_KEY
}

// Fixed seeds: the mix must be stable within the process so concurrent
// probes agree, and nothing about it needs to be secret.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0x6a09_e667_f3bc_c909,
    0xbb67_ae85_84ca_a73b,
    0x3c6e_f372_fe94_f82b,
);

struct Cell {
    key: AtomicI64,
    value: AtomicPtr<ValueSlot>,
}

struct Table {
    cells: Box<[Cell]>,
    mask: usize,
}

impl Table {
    fn new(capacity: usize) -> Table {
        let capacity = capacity.next_power_of_two();
        let cells = (0..capacity)
            .map(|_| Cell {
                key: AtomicI64::new(EMPTY_KEY),
                value: AtomicPtr::new(std::ptr::null_mut()),
            })
            .collect();
        Table {
            cells,
            mask: capacity - 1,
        }
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }
}

pub struct LockFreeMap {
    table: ArcSwap<Table>,
    /// Mutators hold this shared; resize holds it exclusively.
    freeze: RwLock<()>,
    live: AtomicUsize,
    dead: AtomicUsize,
    hasher: ahash::RandomState,
}

impl LockFreeMap {
    pub fn new(initial_capacity: usize) -> LockFreeMap {
        let (k0, k1, k2, k3) = HASH_SEEDS;
        LockFreeMap {
            table: ArcSwap::from_pointee(Table::new(initial_capacity.max(16))),
            freeze: RwLock::new(()),
            live: AtomicUsize::new(0),
            dead: AtomicUsize::new(0),
            hasher: ahash::RandomState::with_seeds(k0, k1, k2, k3),
        }
    }

    fn hash(&self, key: i64) -> usize {
        self.hasher.hash_one(key) as usize
    }

    /// Wait-free. Returns the handle currently published for `key`.
    pub fn lookup(&self, key: i64) -> Option<SlotHandle> {
        let table = self.table.load();
        let mut idx = self.hash(key) & table.mask;
        for _ in 0..table.capacity() {
            let cell = &table.cells[idx];
            let k = cell.key.load(Ordering::Acquire);
            if k == EMPTY_KEY {
                return None;
            }
            if k == key {
                return SlotHandle::from_raw(cell.value.load(Ordering::Acquire));
            }
            idx = (idx + 1) & table.mask;
        }
        None
    }

    pub fn contains(&self, key: i64) -> bool {
        self.lookup(key).is_some()
    }

    /// CAS-inserts `handle` for `key`. On collision the winner's handle
    /// comes back in `Err` and the caller keeps ownership of its slot.
    pub fn insert_if_absent(
        &self,
        key: i64,
        handle: SlotHandle,
    ) -> std::result::Result<(), SlotHandle> {
        debug_assert!(!is_reserved_key(key));
        loop {
            self.maybe_resize();
            let _writers = self.freeze.read();
            let table = self.table.load();
            let mut idx = self.hash(key) & table.mask;
            let mut probed = 0;
            'probe: while probed < table.capacity() {
                let cell = &table.cells[idx];
                let k = cell.key.load(Ordering::Acquire);
                if k == key {
                    // A winner claimed the cell; wait out its publication.
                    loop {
                        let p = cell.value.load(Ordering::Acquire);
                        if let Some(winner) = SlotHandle::from_raw(p) {
                            return Err(winner);
                        }
                        if cell.key.load(Ordering::Acquire) != key {
                            // Claimed then removed; keep probing.
                            idx = (idx + 1) & table.mask;
                            probed += 1;
                            continue 'probe;
                        }
                        std::hint::spin_loop();
                    }
                }
                if k == EMPTY_KEY {
                    if cell
                        .key
                        .compare_exchange(EMPTY_KEY, key, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        cell.value.store(handle.as_ptr(), Ordering::Release);
                        self.live.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    // Lost the cell; re-examine it.
                    continue 'probe;
                }
                idx = (idx + 1) & table.mask;
                probed += 1;
            }
            // Probed the whole table; force a resize and retry.
            drop(_writers);
            self.resize();
        }
    }

    /// Tombstones the cell and returns the handle; the caller must
    /// deallocate the slot.
    pub fn remove(&self, key: i64) -> Option<SlotHandle> {
        let _writers = self.freeze.read();
        let table = self.table.load();
        let mut idx = self.hash(key) & table.mask;
        for _ in 0..table.capacity() {
            let cell = &table.cells[idx];
            let k = cell.key.load(Ordering::Acquire);
            if k == EMPTY_KEY {
                return None;
            }
            if k == key {
                let p = cell.value.swap(std::ptr::null_mut(), Ordering::AcqRel);
                let handle = SlotHandle::from_raw(p)?;
                cell.key.store(TOMBSTONE_KEY, Ordering::Release);
                self.live.fetch_sub(1, Ordering::Relaxed);
                self.dead.fetch_add(1, Ordering::Relaxed);
                return Some(handle);
            }
            idx = (idx + 1) & table.mask;
        }
        None
    }

    /// Exact count of live cells.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unordered snapshot walk. Does not block writers; inserts
    /// concurrent with the walk may be missed.
    pub fn for_each(&self, mut f: impl FnMut(i64, SlotHandle)) {
        let table = self.table.load();
        for cell in table.cells.iter() {
            let k = cell.key.load(Ordering::Acquire);
            if is_reserved_key(k) {
                continue;
            }
            if let Some(handle) = SlotHandle::from_raw(cell.value.load(Ordering::Acquire)) {
                f(k, handle);
            }
        }
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> Vec<i64> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|k, _| out.push(k));
        out
    }

    /// Blocks all mutators for the guard's lifetime. Lookups continue.
    /// Used by shrink, which must not race eviction.
    pub fn freeze_writers(&self) -> RwLockWriteGuard<'_, ()> {
        self.freeze.write()
    }

    /// Removes every entry matching `pred` in one pass with mutators
    /// frozen, returning the victims for the caller to deallocate.
    pub fn remove_where(
        &self,
        mut pred: impl FnMut(i64, SlotHandle) -> bool,
    ) -> Vec<(i64, SlotHandle)> {
        let _frozen = self.freeze.write();
        let table = self.table.load();
        let mut removed = Vec::new();
        for cell in table.cells.iter() {
            let k = cell.key.load(Ordering::Acquire);
            if is_reserved_key(k) {
                continue;
            }
            let Some(handle) = SlotHandle::from_raw(cell.value.load(Ordering::Acquire)) else {
                continue;
            };
            if pred(k, handle) {
                cell.value.store(std::ptr::null_mut(), Ordering::Release);
                cell.key.store(TOMBSTONE_KEY, Ordering::Release);
                self.live.fetch_sub(1, Ordering::Relaxed);
                self.dead.fetch_add(1, Ordering::Relaxed);
                removed.push((k, handle));
            }
        }
        removed
    }

    fn load_exceeded(&self) -> bool {
        let cap = self.table.load().capacity();
        let used = self.live.load(Ordering::Relaxed) + self.dead.load(Ordering::Relaxed);
        (used + 1) * 10 >= cap * 7
    }

    fn maybe_resize(&self) {
        if self.load_exceeded() {
            self.resize();
        }
    }

    fn resize(&self) {
        let _frozen = self.freeze.write();
        // Another writer may have resized while we waited for the lock.
        if !self.load_exceeded() {
            return;
        }
        let old = self.table.load();
        let mut cap = old.capacity() * 2;
        let live = self.live.load(Ordering::Relaxed);
        while (live + 1) * 10 >= cap * 7 {
            cap *= 2;
        }
        let new = Table::new(cap);
        for cell in old.cells.iter() {
            let k = cell.key.load(Ordering::Acquire);
            if is_reserved_key(k) {
                continue;
            }
            let p = cell.value.load(Ordering::Acquire);
            if p.is_null() {
                continue;
            }
            // Exclusive access: plain probe, first empty cell wins.
            let mut idx = self.hash(k) & new.mask;
            loop {
                let c = &new.cells[idx];
                if c.key.load(Ordering::Relaxed) == EMPTY_KEY {
                    c.key.store(k, Ordering::Relaxed);
                    c.value.store(p, Ordering::Relaxed);
                    break;
                }
                idx = (idx + 1) & new.mask;
            }
        }
        self.dead.store(0, Ordering::Relaxed);
        self.table.store(Arc::new(new));
    }
}
