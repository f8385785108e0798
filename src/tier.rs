//! Single-tier storage: an index plus a payload backing.
//!
//! In-memory tiers (HBM, DRAM) pair a lock-free map with a memory pool;
//! the allocator behind the pool is what distinguishes them. The SSD
//! tier pairs the log's manifest with the segment files and materializes
//! transient slots on read.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::hashmap::LockFreeMap;
use crate::pool::{ByteAllocator, MemoryPool};
use crate::slot::{SlotFlags, SlotHandle, SlotLayout, TierTag, ValueSlot, MAX_SUB_EMBEDDINGS};
use crate::ssd::{SsdLog, SsdLogOptions, SsdRecord};

/// Flag bits that survive a round-trip through the SSD log: the init
/// bits and FROZEN. Pool membership and shadow state are per-residence.
fn persistent_flags(flags: SlotFlags) -> u64 {
    let mask = SlotFlags::from_bits_retain((1 << MAX_SUB_EMBEDDINGS) - 1) | SlotFlags::FROZEN;
    (flags & mask).bits() as u64
}

/// An in-memory tier: lock-free index + pooled payloads.
pub struct MemTier {
    tag: TierTag,
    map: LockFreeMap,
    pool: MemoryPool,
    layout: SlotLayout,
}

impl MemTier {
    pub fn new(
        tag: TierTag,
        layout: SlotLayout,
        block_size: usize,
        allocator: Arc<dyn ByteAllocator>,
    ) -> MemTier {
        let total_dims = layout.total_dims();
        MemTier {
            tag,
            map: LockFreeMap::new(1024),
            pool: MemoryPool::new(total_dims, block_size, allocator),
            layout,
        }
    }

    pub fn tag(&self) -> TierTag {
        self.tag
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// A fresh zeroed slot backed by this tier's pool.
    pub fn create_slot(&self) -> Result<Box<ValueSlot>> {
        let buf = self.pool.allocate()?;
        Ok(Box::new(ValueSlot::pooled(
            buf,
            self.layout.total_dims(),
            self.tag,
        )))
    }

    pub fn create_shadow(&self) -> Box<ValueSlot> {
        Box::new(ValueSlot::shadow(self.layout.total_dims(), self.tag))
    }

    /// Gives a shadow slot a payload buffer. False when another thread
    /// won the upgrade; the losing buffer goes straight back to the pool.
    pub fn upgrade_shadow(&self, slot: &ValueSlot) -> Result<bool> {
        let buf = self.pool.allocate()?;
        if slot.publish_payload(buf) {
            Ok(true)
        } else {
            self.pool.deallocate(buf);
            Ok(false)
        }
    }

    pub fn get(&self, id: i64) -> Option<SlotHandle> {
        self.map.lookup(id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.map.contains(id)
    }

    /// Unconditional publish: any already-present slot for `id` is
    /// destroyed and replaced. Used by demotion, where the incoming copy
    /// is the newest.
    pub fn insert(&self, id: i64, slot: Box<ValueSlot>) -> SlotHandle {
        let handle = SlotHandle::from_box(slot);
        loop {
            match self.map.insert_if_absent(id, handle) {
                Ok(()) => return handle,
                Err(_stale) => {
                    self.remove(id);
                }
            }
        }
    }

    /// Publishes `slot` for `id`. Returns the surviving handle and
    /// whether it is ours; a losing slot is destroyed here.
    pub fn try_insert(&self, id: i64, slot: Box<ValueSlot>) -> (SlotHandle, bool) {
        let handle = SlotHandle::from_box(slot);
        match self.map.insert_if_absent(id, handle) {
            Ok(()) => (handle, true),
            Err(winner) => {
                self.destroy_detached(handle);
                (winner, false)
            }
        }
    }

    /// Removes and destroys the slot; its payload returns to the pool.
    pub fn remove(&self, id: i64) -> bool {
        match self.map.remove(id) {
            Some(handle) => {
                self.destroy_detached(handle);
                true
            }
            None => false,
        }
    }

    /// Frees a slot that is no longer reachable through the map.
    pub fn destroy_detached(&self, handle: SlotHandle) {
        let slot = unsafe { handle.into_box() };
        if slot.flags().contains(SlotFlags::IN_MEMORY_POOL) {
            if let Some(buf) = slot.take_payload() {
                self.pool.deallocate(buf);
            }
        }
        drop(slot);
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn for_each(&self, f: impl FnMut(i64, SlotHandle)) {
        self.map.for_each(f);
    }

    /// Removes every slot matching `pred` with tier mutators frozen.
    /// Returns the removed ids.
    pub fn shrink(&self, pred: impl FnMut(i64, SlotHandle) -> bool) -> Vec<i64> {
        let victims = self.map.remove_where(pred);
        let mut ids = Vec::with_capacity(victims.len());
        for (id, handle) in victims {
            self.destroy_detached(handle);
            ids.push(id);
        }
        ids
    }

    pub fn clear(&self) {
        self.shrink(|_, _| true);
    }
}

impl Drop for MemTier {
    fn drop(&mut self) {
        self.clear();
    }
}

/// The bottom of the hierarchy: the log's manifest is the index, reads
/// materialize transient slots.
pub struct SsdTier {
    log: SsdLog,
    layout: SlotLayout,
}

impl SsdTier {
    pub fn open(dir: &Path, layout: SlotLayout, opts: SsdLogOptions) -> Result<SsdTier> {
        let log = SsdLog::open(dir, opts)?;
        Ok(SsdTier { log, layout })
    }

    pub fn log(&self) -> &SsdLog {
        &self.log
    }

    /// Materializes a transient slot for `id`. The caller promotes it
    /// and then destroys it (copy-back-and-destroy).
    pub fn get(&self, id: i64) -> Result<Option<Box<ValueSlot>>> {
        let mut payload = vec![0f32; self.layout.total_dims()].into_boxed_slice();
        let Some(meta) = self.log.get(id, &mut payload)? else {
            return Ok(None);
        };
        let slot = ValueSlot::transient(payload, TierTag::SsdCached);
        slot.restore_header(meta.version, meta.frequency);
        slot.set_flags(SlotFlags::from_bits_retain(meta.flags as u32));
        Ok(Some(Box::new(slot)))
    }

    /// Write-through for one slot.
    pub fn commit(&self, id: i64, slot: &ValueSlot) -> Result<()> {
        debug_assert!(slot.has_payload());
        let payload = unsafe { slot.payload_slice() };
        self.log.commit(
            id,
            persistent_flags(slot.flags()),
            slot.version(),
            slot.frequency(),
            payload,
        )
    }

    /// Demotion sink: appends the whole batch with one fsync.
    pub fn batch_commit(&self, items: &[(i64, SlotHandle)]) -> Result<()> {
        let records: Vec<SsdRecord<'_>> = items
            .iter()
            .map(|&(id, handle)| {
                let slot = unsafe { handle.slot() };
                SsdRecord {
                    key: id,
                    flags: persistent_flags(slot.flags()),
                    version: slot.version(),
                    frequency: slot.frequency(),
                    payload: unsafe { slot.payload_slice() },
                }
            })
            .collect();
        self.log.flush_batch(&records)?;
        Ok(())
    }

    pub fn remove(&self, id: i64) -> bool {
        self.log.remove(id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.log.contains(id)
    }

    pub fn size(&self) -> usize {
        self.log.len()
    }

    pub fn keys(&self) -> Vec<i64> {
        self.log.keys()
    }

    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoScheme;
    use crate::pool::HeapAllocator;

    fn mem_tier() -> MemTier {
        MemTier::new(
            TierTag::Dram,
            SlotLayout::normal(4, 1),
            64,
            Arc::new(HeapAllocator),
        )
    }

    #[test]
    fn create_insert_get_remove() {
        let tier = mem_tier();
        let slot = tier.create_slot().unwrap();
        slot.write_payload(&[1.0, 2.0, 3.0, 4.0]);
        let (handle, won) = tier.try_insert(11, slot);
        assert!(won);
        assert_eq!(tier.get(11), Some(handle));
        assert_eq!(tier.size(), 1);

        assert!(tier.remove(11));
        assert_eq!(tier.size(), 0);
        // The payload buffer went back to the pool.
        assert!(tier.pool.free_buffers() > 0);
    }

    #[test]
    fn losing_insert_recycles_payload() {
        let tier = mem_tier();
        let (first, won) = tier.try_insert(5, tier.create_slot().unwrap());
        assert!(won);
        let before = tier.pool.free_buffers();
        let (winner, won) = tier.try_insert(5, tier.create_slot().unwrap());
        assert!(!won);
        assert_eq!(winner, first);
        assert_eq!(tier.pool.free_buffers(), before);
        tier.remove(5);
    }

    #[test]
    fn insert_replaces_existing() {
        let tier = mem_tier();
        let first = tier.create_slot().unwrap();
        first.update_version(1);
        tier.try_insert(4, first);

        let newer = tier.create_slot().unwrap();
        newer.update_version(2);
        let handle = tier.insert(4, newer);
        assert_eq!(tier.get(4), Some(handle));
        assert_eq!(unsafe { handle.slot() }.version(), 2);
        assert_eq!(tier.size(), 1);
        tier.remove(4);
    }

    #[test]
    fn shadow_upgrade_through_tier() {
        let tier = mem_tier();
        let (handle, _) = tier.try_insert(9, tier.create_shadow());
        let slot = unsafe { handle.slot() };
        assert!(slot.is_shadow());
        assert!(tier.upgrade_shadow(slot).unwrap());
        assert!(!slot.is_shadow());
        assert!(slot.has_payload());
        assert!(!tier.upgrade_shadow(slot).unwrap());
        tier.remove(9);
    }

    #[test]
    fn shrink_removes_matching_slots() {
        let tier = mem_tier();
        for id in 0..10 {
            let slot = tier.create_slot().unwrap();
            slot.update_version(id);
            tier.try_insert(id, slot);
        }
        let mut removed = tier.shrink(|_, h| unsafe { h.slot() }.version() < 5);
        removed.sort_unstable();
        assert_eq!(removed, vec![0, 1, 2, 3, 4]);
        assert_eq!(tier.size(), 5);
    }

    #[test]
    fn ssd_tier_round_trips_slots() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SlotLayout::normal(4, 1);
        let tier = SsdTier::open(
            dir.path(),
            layout.clone(),
            SsdLogOptions {
                total_dims: layout.total_dims(),
                segment_bytes: 1 << 16,
                compaction_threshold: 0.5,
                max_sealed_segments: 8,
                async_compaction: false,
                io_scheme: IoScheme::Mmap,
            },
        )
        .unwrap();

        let src = ValueSlot::transient(
            vec![5.0f32; layout.total_dims()].into_boxed_slice(),
            TierTag::SsdCached,
        );
        src.update_version(33);
        src.add_frequency(2, i64::MAX);
        src.mark_initialized(0);
        tier.commit(77, &src).unwrap();

        let restored = tier.get(77).unwrap().unwrap();
        assert_eq!(restored.version(), 33);
        assert_eq!(restored.frequency(), 2);
        assert!(restored.is_initialized(0));
        assert!(!restored.flags().contains(SlotFlags::IN_MEMORY_POOL));
        assert_eq!(unsafe { restored.payload_slice() }[0], 5.0);
        assert!(tier.get(78).unwrap().is_none());
    }
}
