//! Tier composition: lookup routing, copy-back promotion, admission on
//! miss, and the background eviction engine.
//!
//! Lookups walk top-down. A hit below the top tier is promoted by
//! copying into a fresh tier-0 slot and publishing it with `try_insert`;
//! the loser of a publish race recycles its buffer and adopts the
//! winner. Eviction runs on a dedicated task that drains each
//! over-capacity tier into the tier below it in batches; the bottom tier
//! never evicts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::cache::CachePolicy;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::filter::AdmissionPolicy;
use crate::pool::{ByteAllocator, HeapAllocator};
use crate::slot::{CopyBackHint, SlotHandle, SlotLayout, TierTag, ValueSlot};
use crate::ssd::SsdLogOptions;
use crate::tier::{MemTier, SsdTier};

/// How often the evictor sweeps even without an explicit wake.
const EVICTION_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a fast-path lookup.
pub enum LookupOutcome {
    /// Existing admitted slot (possibly just promoted).
    Hit(SlotHandle),
    /// Fresh slot; the caller must write the default value.
    Created(SlotHandle),
    /// Below the admission threshold; nothing to write to.
    Filtered,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

enum EvictorMsg {
    Wake,
    Shutdown,
}

pub(crate) struct StorageCore {
    mem: Vec<MemTier>,
    ssd: Option<SsdTier>,
    caches: Vec<CachePolicy>,
    /// Per mem tier, in slots.
    capacities: Vec<usize>,
    admission: AdmissionPolicy,
    layout: SlotLayout,
    max_freq: i64,
    eviction_batch: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Serializes eviction sweeps: the tier-transition state machine
    /// runs one pass at a time.
    eviction_lock: Mutex<()>,
    shutdown: AtomicBool,
}

pub struct LayeredStorage {
    core: Arc<StorageCore>,
    evict_tx: Option<Sender<EvictorMsg>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl LayeredStorage {
    /// Builds the tier stack for `cfg`. An HBM storage type requires the
    /// embedder to inject the device allocator.
    pub fn new(
        cfg: &EmbeddingConfig,
        hbm_allocator: Option<Arc<dyn ByteAllocator>>,
    ) -> Result<LayeredStorage> {
        cfg.validate()?;
        let layout = SlotLayout::from_config(cfg);

        let mut mem = Vec::new();
        if cfg.storage_type.has_hbm() {
            let allocator = hbm_allocator.ok_or_else(|| {
                Error::invalid("HBM tier requested without a device allocator")
            })?;
            mem.push(MemTier::new(
                TierTag::Hbm,
                layout.clone(),
                cfg.block_size,
                allocator,
            ));
        }
        mem.push(MemTier::new(
            TierTag::Dram,
            layout.clone(),
            cfg.block_size,
            Arc::new(HeapAllocator),
        ));

        let ssd = match (cfg.storage_type.has_ssd(), &cfg.ssd_dir) {
            (true, Some(dir)) => Some(SsdTier::open(
                dir,
                layout.clone(),
                SsdLogOptions::from_config(cfg, layout.total_dims()),
            )?),
            _ => None,
        };

        let caches: Vec<CachePolicy> = (0..mem.len())
            .map(|_| CachePolicy::new(cfg.cache_strategy))
            .collect();
        let capacities: Vec<usize> = (0..mem.len())
            .map(|i| (cfg.size[i] / layout.payload_bytes()).max(1))
            .collect();

        let core = Arc::new(StorageCore {
            mem,
            ssd,
            caches,
            capacities,
            admission: AdmissionPolicy::from_config(cfg),
            layout,
            max_freq: cfg.max_freq,
            eviction_batch: cfg.eviction_batch_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        });

        // The evictor only exists when some tier has a sink below it.
        let needs_evictor = core.mem.len() > 1 || core.ssd.is_some();
        let (evict_tx, evictor) = if needs_evictor {
            let (tx, rx) = bounded::<EvictorMsg>(1);
            let thread_core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name("tierkv-evictor".into())
                .spawn(move || loop {
                    match rx.recv_timeout(EVICTION_INTERVAL) {
                        Ok(EvictorMsg::Wake) | Err(RecvTimeoutError::Timeout) => {
                            thread_core.eviction_pass();
                        }
                        Ok(EvictorMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .expect("spawn evictor thread");
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(LayeredStorage {
            core,
            evict_tx,
            evictor: Mutex::new(evictor),
        })
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.core.layout
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.core.hits.load(Ordering::Relaxed),
            misses: self.core.misses.load(Ordering::Relaxed),
        }
    }

    /// Ids across every tier.
    pub fn size(&self) -> usize {
        self.core.size()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.core.mem.iter().any(|t| t.contains(id))
            || self.core.ssd.as_ref().is_some_and(|t| t.contains(id))
    }

    /// The fast path: find `id` in some tier (promoting as needed) or
    /// create it at tier 0 if admitted. `count` is the id's multiplicity
    /// in the current batch; `create` is false for filter-only access.
    pub fn lookup_or_create(&self, id: i64, count: i64, create: bool) -> Result<LookupOutcome> {
        let outcome = self.core.lookup_or_create(id, count, create)?;
        if matches!(outcome, LookupOutcome::Created(_)) {
            self.maybe_wake_evictor();
        }
        Ok(outcome)
    }

    /// Seeds ids expected hot soon (e.g. the next batch's keys).
    pub fn add_to_prefetch_list(&self, ids: &[i64]) {
        self.core.caches[0].add_to_prefetch_list(ids);
    }

    pub fn add_to_cache(&self, ids: &[i64]) {
        self.core.caches[0].add_to_cache(ids);
        self.maybe_wake_evictor();
    }

    /// Removes `id` from whichever tier holds it.
    pub fn remove(&self, id: i64) -> bool {
        self.core.remove(id)
    }

    /// Removes every slot matching `pred`, tier by tier, each under that
    /// tier's exclusive lock. Returns the removed count.
    pub fn shrink(
        &self,
        pred: impl Fn(i64, &ValueSlot) -> bool + Copy,
    ) -> Result<usize> {
        self.core.shrink(pred)
    }

    /// Spills every in-memory slot into the SSD log and retires the
    /// memory copies (no-op without an SSD tier). Used at shutdown.
    pub fn flush(&self) -> Result<()> {
        self.core.flush()
    }

    /// One synchronous eviction sweep; tests use this for determinism.
    pub fn run_eviction_pass(&self) {
        self.core.eviction_pass();
    }

    pub(crate) fn core(&self) -> &Arc<StorageCore> {
        &self.core
    }

    fn maybe_wake_evictor(&self) {
        let Some(tx) = &self.evict_tx else { return };
        let over = self
            .core
            .caches
            .iter()
            .zip(&self.core.capacities)
            .any(|(cache, &cap)| cache.size() > cap);
        if over {
            match tx.try_send(EvictorMsg::Wake) {
                Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Stops the evictor at a batch boundary, spills memory tiers to
    /// the SSD log, and seals it.
    pub fn close(&self) -> Result<()> {
        if self.core.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(tx) = &self.evict_tx {
            let _ = tx.send(EvictorMsg::Shutdown);
        }
        if let Some(handle) = self.evictor.lock().take() {
            let _ = handle.join();
        }
        if let Some(ssd) = &self.core.ssd {
            self.core.flush()?;
            ssd.close()?;
        }
        Ok(())
    }
}

impl Drop for LayeredStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl StorageCore {
    pub(crate) fn mem_tiers(&self) -> &[MemTier] {
        &self.mem
    }

    pub(crate) fn ssd_tier(&self) -> Option<&SsdTier> {
        self.ssd.as_ref()
    }

    pub(crate) fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    fn size(&self) -> usize {
        let mem: usize = self.mem.iter().map(|t| t.size()).sum();
        mem + self.ssd.as_ref().map_or(0, |t| t.size())
    }

    fn lookup_or_create(&self, id: i64, count: i64, create: bool) -> Result<LookupOutcome> {
        // Top tier.
        if let Some(handle) = self.mem[0].get(id) {
            let slot = unsafe { handle.slot() };
            if slot.is_shadow() {
                return self.progress_shadow(id, handle, count, create);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            slot.add_frequency(count, self.max_freq);
            self.caches[0].touch(id, count);
            return Ok(LookupOutcome::Hit(handle));
        }

        // Lower in-memory tiers: copy back.
        for level in 1..self.mem.len() {
            if let Some(src) = self.mem[level].get(id) {
                return self.promote(id, src, CopyBackHint::CopyBack, level, count);
            }
        }

        // SSD: copy back, then destroy the transient.
        if let Some(ssd) = &self.ssd {
            if let Some(transient) = ssd.get(id)? {
                let src = SlotHandle::from_box(transient);
                return self.promote(id, src, CopyBackHint::CopyBackAndDestroy, 0, count);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if !create {
            // Filter-only access: the observation still lands in the
            // bloom filter, but nothing is created.
            if let AdmissionPolicy::Bloom(bloom) = &self.admission {
                bloom.observe(id, count);
            }
            return Ok(LookupOutcome::Filtered);
        }
        self.create(id, count)
    }

    /// Admission progression for an existing shadow slot.
    fn progress_shadow(
        &self,
        id: i64,
        handle: SlotHandle,
        count: i64,
        create: bool,
    ) -> Result<LookupOutcome> {
        let slot = unsafe { handle.slot() };
        let admitted = match &self.admission {
            AdmissionPolicy::Frequency(f) => {
                let crossed = f.observe(slot, count);
                if !create {
                    // Filter-only reads record the observation but never
                    // upgrade; the next write access does.
                    return Ok(LookupOutcome::Filtered);
                }
                crossed
            }
            // Shadow slots only exist under the frequency policy, but a
            // reconfigured store may still hold some; admit them.
            _ => true,
        };
        if !admitted {
            return Ok(LookupOutcome::Filtered);
        }
        if self.mem[0].upgrade_shadow(slot)? {
            self.caches[0].touch(id, count);
            Ok(LookupOutcome::Created(handle))
        } else {
            // Another thread upgraded first and owns default init.
            self.caches[0].touch(id, count);
            Ok(LookupOutcome::Hit(handle))
        }
    }

    /// Copy-back promotion: a fresh tier-0 slot takes the source's
    /// header and payload, `try_insert` publishes it, and the hint says
    /// how to retire the source. `src_level` only matters for
    /// `CopyBack`.
    fn promote(
        &self,
        id: i64,
        src: SlotHandle,
        hint: CopyBackHint,
        src_level: usize,
        count: i64,
    ) -> Result<LookupOutcome> {
        let fresh = self.mem[0].create_slot()?;
        fresh.copy_from(unsafe { src.slot() });
        let (handle, won) = self.mem[0].try_insert(id, fresh);
        match hint {
            CopyBackHint::CopyBack if won => {
                // Retire the lower-tier copy; a concurrent eviction of
                // this id lost the insert race above and reads the new
                // location instead.
                self.mem[src_level].remove(id);
                self.caches[src_level].remove(id);
            }
            CopyBackHint::CopyBackAndDestroy => {
                if won {
                    if let Some(ssd) = &self.ssd {
                        ssd.remove(id);
                    }
                }
                drop(unsafe { src.into_box() });
            }
            _ => {}
        }
        let slot = unsafe { handle.slot() };
        slot.add_frequency(count, self.max_freq);
        self.caches[0].touch(id, count);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(LookupOutcome::Hit(handle))
    }

    fn create(&self, id: i64, count: i64) -> Result<LookupOutcome> {
        match &self.admission {
            AdmissionPolicy::Always => self.create_full(id, count),
            AdmissionPolicy::Bloom(bloom) => {
                if bloom.observe(id, count) {
                    self.create_full(id, count)
                } else {
                    Ok(LookupOutcome::Filtered)
                }
            }
            AdmissionPolicy::Frequency(_) => {
                let (handle, _won) = self.mem[0].try_insert(id, self.mem[0].create_shadow());
                // Whether ours or a racing thread's, drive admission on
                // the surviving slot.
                self.progress_shadow(id, handle, count, true)
            }
        }
    }

    fn create_full(&self, id: i64, count: i64) -> Result<LookupOutcome> {
        let fresh = self.mem[0].create_slot()?;
        let (handle, won) = self.mem[0].try_insert(id, fresh);
        let slot = unsafe { handle.slot() };
        slot.add_frequency(count, self.max_freq);
        self.caches[0].touch(id, count);
        if won {
            Ok(LookupOutcome::Created(handle))
        } else {
            Ok(LookupOutcome::Hit(handle))
        }
    }

    fn remove(&self, id: i64) -> bool {
        let mut removed = false;
        for (level, tier) in self.mem.iter().enumerate() {
            if tier.remove(id) {
                self.caches[level].remove(id);
                removed = true;
            }
        }
        if let Some(ssd) = &self.ssd {
            removed |= ssd.remove(id);
        }
        removed
    }

    /// One sweep: drain every over-capacity tier into its sink. When
    /// the pass returns, no demotion of this sweep is still in flight.
    pub(crate) fn eviction_pass(&self) {
        let _pass = self.eviction_lock.lock();
        for level in 0..self.mem.len() {
            let has_sink = level + 1 < self.mem.len() || self.ssd.is_some();
            if !has_sink {
                continue;
            }
            while !self.shutdown.load(Ordering::Acquire) {
                let size = self.caches[level].size();
                let cap = self.capacities[level];
                if size <= cap {
                    break;
                }
                let want = (size - cap).min(self.eviction_batch);
                let mut victims = Vec::with_capacity(want);
                if self.caches[level].get_evict_ids(&mut victims, want) == 0 {
                    break;
                }
                if let Err(e) = self.demote(level, &victims) {
                    log::warn!("[evictor] demotion from tier {level} failed: {e}");
                    break;
                }
            }
        }
    }

    /// Moves the victims one tier down. Payloads return to this tier's
    /// pool; index entries are tombstoned.
    fn demote(&self, level: usize, victims: &[i64]) -> Result<()> {
        if level + 1 < self.mem.len() {
            let lower = &self.mem[level + 1];
            let mut arrived = Vec::with_capacity(victims.len());
            for &id in victims {
                let Some(src) = self.mem[level].get(id) else {
                    continue;
                };
                let fresh = lower.create_slot()?;
                fresh.copy_from(unsafe { src.slot() });
                // Unconditional: a stale lower copy would otherwise
                // shadow the demoted bytes.
                lower.insert(id, fresh);
                self.mem[level].remove(id);
                arrived.push(id);
            }
            self.caches[level + 1].add_to_cache(&arrived);
        } else if let Some(ssd) = &self.ssd {
            let batch: Vec<(i64, SlotHandle)> = victims
                .iter()
                .filter_map(|&id| self.mem[level].get(id).map(|h| (id, h)))
                .filter(|(_, h)| unsafe { h.slot() }.has_payload())
                .collect();
            ssd.batch_commit(&batch)?;
            for (id, _) in &batch {
                self.mem[level].remove(*id);
            }
        }
        Ok(())
    }

    fn shrink(&self, pred: impl Fn(i64, &ValueSlot) -> bool + Copy) -> Result<usize> {
        let mut removed = 0usize;
        for (level, tier) in self.mem.iter().enumerate() {
            let ids = tier.shrink(|id, handle| pred(id, unsafe { handle.slot() }));
            for id in &ids {
                self.caches[level].remove(*id);
            }
            removed += ids.len();
        }
        if let Some(ssd) = &self.ssd {
            for id in ssd.keys() {
                match ssd.get(id)? {
                    Some(slot) if pred(id, &slot) => {
                        ssd.remove(id);
                        removed += 1;
                    }
                    _ => {}
                }
            }
        }
        Ok(removed)
    }

    /// Checkpoint restore of an admitted id: bypasses admission, writes
    /// the primary embedding and header, and re-seeds the bloom filter
    /// so admission stays sticky across restarts.
    pub(crate) fn import_full(
        &self,
        id: i64,
        primary: &[f32],
        version: i64,
        frequency: i64,
    ) -> Result<()> {
        if let AdmissionPolicy::Bloom(bloom) = &self.admission {
            bloom.observe(id, frequency.max(1));
        }
        let handle = match self.mem[0].get(id) {
            Some(handle) => handle,
            None => {
                let fresh = self.mem[0].create_slot()?;
                self.mem[0].try_insert(id, fresh).0
            }
        };
        let slot = unsafe { handle.slot() };
        if slot.is_shadow() && !self.mem[0].upgrade_shadow(slot)? && !slot.has_payload() {
            return Err(Error::precondition(format!(
                "id {id}: shadow slot without payload during import"
            )));
        }
        let sub = self.layout.primary();
        debug_assert_eq!(primary.len(), sub.len);
        let payload = unsafe { slot.payload_slice_mut() };
        payload[sub.offset..sub.offset + sub.len].copy_from_slice(primary);
        slot.restore_header(version, frequency);
        slot.mark_initialized(0);
        self.caches[0].touch(id, frequency.max(1));
        Ok(())
    }

    /// Checkpoint restore of a below-threshold id: only its observation
    /// state comes back.
    pub(crate) fn import_filtered(&self, id: i64, version: i64, frequency: i64) -> Result<()> {
        match &self.admission {
            AdmissionPolicy::Bloom(bloom) => {
                bloom.observe(id, frequency.max(1));
            }
            AdmissionPolicy::Frequency(_) => {
                let (handle, _) = self.mem[0].try_insert(id, self.mem[0].create_shadow());
                let slot = unsafe { handle.slot() };
                if slot.is_shadow() {
                    slot.restore_header(version, frequency);
                }
            }
            // No filter: nothing to restore for an id without values.
            AdmissionPolicy::Always => {}
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let Some(ssd) = &self.ssd else { return Ok(()) };
        for (level, tier) in self.mem.iter().enumerate() {
            let mut batch = Vec::new();
            tier.for_each(|id, handle| {
                if unsafe { handle.slot() }.has_payload() {
                    batch.push((id, handle));
                }
            });
            if batch.is_empty() {
                continue;
            }
            ssd.batch_commit(&batch)?;
            // Retire the memory copies; an id stays reachable through
            // exactly one tier.
            for (id, _) in batch {
                tier.remove(id);
                self.caches[level].remove(id);
            }
        }
        ssd.log().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheStrategy, StorageType};

    fn dram_config(value_len: usize) -> EmbeddingConfig {
        EmbeddingConfig::new(value_len)
    }

    fn handle_of(outcome: LookupOutcome) -> SlotHandle {
        match outcome {
            LookupOutcome::Hit(h) | LookupOutcome::Created(h) => h,
            LookupOutcome::Filtered => panic!("unexpectedly filtered"),
        }
    }

    #[test]
    fn create_then_hit() {
        let storage = LayeredStorage::new(&dram_config(4), None).unwrap();
        let h1 = handle_of(storage.lookup_or_create(1, 1, true).unwrap());
        let slot = unsafe { h1.slot() };
        slot.write_payload(&[1.0, 2.0, 3.0, 4.0]);
        slot.mark_initialized(0);

        let h2 = handle_of(storage.lookup_or_create(1, 1, true).unwrap());
        assert_eq!(h1, h2);
        assert_eq!(unsafe { h2.slot().payload_slice() }, &[1.0, 2.0, 3.0, 4.0]);
        let stats = storage.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn filter_only_access_creates_nothing() {
        let storage = LayeredStorage::new(&dram_config(4), None).unwrap();
        assert!(matches!(
            storage.lookup_or_create(5, 1, false).unwrap(),
            LookupOutcome::Filtered
        ));
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn bloom_filter_blocks_until_threshold() {
        let cfg = dram_config(4).with_filter_freq(3);
        let storage = LayeredStorage::new(&cfg, None).unwrap();
        assert!(matches!(
            storage.lookup_or_create(9, 1, true).unwrap(),
            LookupOutcome::Filtered
        ));
        assert!(matches!(
            storage.lookup_or_create(9, 1, true).unwrap(),
            LookupOutcome::Filtered
        ));
        assert!(matches!(
            storage.lookup_or_create(9, 1, true).unwrap(),
            LookupOutcome::Created(_)
        ));
        assert_eq!(storage.size(), 1);
    }

    #[test]
    fn frequency_filter_keeps_shadow_until_threshold() {
        let mut cfg = dram_config(4).with_filter_freq(2);
        cfg.use_counter_filter = true;
        let storage = LayeredStorage::new(&cfg, None).unwrap();

        assert!(matches!(
            storage.lookup_or_create(3, 1, true).unwrap(),
            LookupOutcome::Filtered
        ));
        // The shadow exists in the map but has no payload.
        let shadow = storage.core().mem_tiers()[0].get(3).unwrap();
        assert!(unsafe { shadow.slot() }.is_shadow());

        let outcome = storage.lookup_or_create(3, 1, true).unwrap();
        let h = handle_of(outcome);
        assert!(!unsafe { h.slot() }.is_shadow());
        assert!(unsafe { h.slot() }.has_payload());
    }

    #[test]
    fn batched_multiplicity_admits_in_one_call() {
        let cfg = dram_config(4).with_filter_freq(4);
        let storage = LayeredStorage::new(&cfg, None).unwrap();
        assert!(matches!(
            storage.lookup_or_create(11, 4, true).unwrap(),
            LookupOutcome::Created(_)
        ));
    }

    #[test]
    fn eviction_demotes_to_ssd() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = dram_config(4)
            .with_storage(StorageType::DramSsd)
            .with_ssd_dir(dir.path());
        // Room for 8 slots in DRAM: value_len 4 is one 16-byte payload.
        cfg.size[0] = 16 * 8;
        cfg.async_compaction = false;
        cfg.eviction_batch_size = 4;
        let storage = LayeredStorage::new(&cfg, None).unwrap();

        for id in 0..32 {
            let h = handle_of(storage.lookup_or_create(id, 1, true).unwrap());
            let slot = unsafe { h.slot() };
            slot.write_payload(&[id as f32; 4]);
            slot.update_version(id);
            slot.mark_initialized(0);
        }
        storage.run_eviction_pass();

        let dram = &storage.core().mem_tiers()[0];
        assert!(dram.size() <= 8, "dram still holds {}", dram.size());
        let ssd = storage.core().ssd_tier().unwrap();
        assert_eq!(dram.size() + ssd.size(), 32);

        // An evicted id promotes back on access with its payload intact.
        let cold = ssd.keys()[0];
        let h = handle_of(storage.lookup_or_create(cold, 1, true).unwrap());
        assert_eq!(unsafe { h.slot().payload_slice() }[0], cold as f32);
        assert!(!ssd.contains(cold), "promotion must retire the ssd copy");
        assert!(dram.contains(cold));
    }

    #[test]
    fn each_id_reachable_through_one_tier() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = dram_config(2)
            .with_storage(StorageType::DramSsd)
            .with_ssd_dir(dir.path())
            .with_cache_strategy(CacheStrategy::Lfu);
        cfg.size[0] = 8 * 10;
        cfg.async_compaction = false;
        let storage = LayeredStorage::new(&cfg, None).unwrap();

        for id in 0..100 {
            let h = handle_of(storage.lookup_or_create(id, 1, true).unwrap());
            unsafe { h.slot() }.write_payload(&[id as f32; 2]);
        }
        storage.run_eviction_pass();
        for id in (0..100).step_by(7) {
            handle_of(storage.lookup_or_create(id, 1, true).unwrap());
        }
        storage.run_eviction_pass();

        let core = storage.core();
        let mut seen = std::collections::HashSet::new();
        for tier in core.mem_tiers() {
            tier.for_each(|id, _| {
                assert!(seen.insert(id), "id {id} reachable through two tiers");
            });
        }
        for id in core.ssd_tier().unwrap().keys() {
            assert!(seen.insert(id), "id {id} in memory and on ssd");
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn remove_spans_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = dram_config(2)
            .with_storage(StorageType::DramSsd)
            .with_ssd_dir(dir.path());
        cfg.size[0] = 8 * 4;
        cfg.async_compaction = false;
        let storage = LayeredStorage::new(&cfg, None).unwrap();
        for id in 0..16 {
            handle_of(storage.lookup_or_create(id, 1, true).unwrap());
        }
        storage.run_eviction_pass();
        for id in 0..16 {
            assert!(storage.remove(id), "id {id} not removed");
        }
        assert_eq!(storage.size(), 0);
    }
}
