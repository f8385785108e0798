//! The public façade consumed by optimizer kernels and checkpoint I/O.
//!
//! `lookup_or_create` is the hot path: it hands back a reference into
//! stable slot memory that the caller reads and writes until the next
//! checkpoint boundary. The store only guarantees lifetime and
//! placement; ordering across updates to one id is established by the
//! caller holding the handle.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::checkpoint::{
    belongs_to_partition, build_shard, parse_shard, CheckpointBundle, ShardEntries,
};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::hashmap::is_reserved_key;
use crate::layered::{CacheStats, LayeredStorage, LookupOutcome, StorageCore};
use crate::pool::ByteAllocator;
use crate::slot::{SlotHandle, SlotLayout, SubEmbedding};

/// A reference into one id's slot, valid until the slot is destroyed or
/// migrated (shrink, explicit remove, close).
#[derive(Debug, Clone, Copy)]
pub struct ValueRef {
    handle: SlotHandle,
    primary: SubEmbedding,
}

impl ValueRef {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// Base pointer of the whole payload (all sub-embeddings).
    pub fn payload_ptr(&self) -> *mut f32 {
        unsafe { self.handle.slot() }.payload_ptr()
    }

    pub fn version(&self) -> i64 {
        unsafe { self.handle.slot() }.version()
    }

    pub fn frequency(&self) -> i64 {
        unsafe { self.handle.slot() }.frequency()
    }

    /// The primary embedding.
    ///
    /// # Safety
    /// Handle-lifetime contract: the slot must not be destroyed while
    /// the slice is held, and writes require ownership of this id's
    /// read-modify-write cycle.
    pub unsafe fn primary(&self) -> &[f32] {
        let payload = self.handle.slot().payload_slice();
        &payload[self.primary.offset..self.primary.offset + self.primary.len]
    }

    /// # Safety
    /// As [`ValueRef::primary`].
    pub unsafe fn primary_mut(&self) -> &mut [f32] {
        let payload = self.handle.slot().payload_slice_mut();
        &mut payload[self.primary.offset..self.primary.offset + self.primary.len]
    }

    /// Copies the primary embedding out.
    pub fn read_primary(&self, out: &mut [f32]) {
        out.copy_from_slice(unsafe { self.primary() });
    }
}

/// Fast-path result: either a writable slot or "serve the default".
pub enum Lookup {
    Admitted(ValueRef),
    /// Below the admission threshold (or filter-only access on a miss);
    /// the caller serves its default value and must not write.
    Filtered,
}

impl Lookup {
    pub fn admitted(self) -> Option<ValueRef> {
        match self {
            Lookup::Admitted(v) => Some(v),
            Lookup::Filtered => None,
        }
    }
}

/// One entry of a snapshot's SSD remainder.
pub struct SnapshotEntry {
    pub id: i64,
    pub value: Vec<f32>,
    pub version: i64,
    pub frequency: i64,
}

/// Lazily yields the ids that live only on SSD.
pub struct SsdRemainderIter {
    core: Arc<StorageCore>,
    ids: Vec<i64>,
    pos: usize,
}

impl Iterator for SsdRemainderIter {
    type Item = Result<SnapshotEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = *self.ids.get(self.pos)?;
            self.pos += 1;
            let Some(ssd) = self.core.ssd_tier() else {
                return None;
            };
            match ssd.get(id) {
                Ok(Some(slot)) => {
                    let sub = self.core.layout().primary();
                    let payload = unsafe { slot.payload_slice() };
                    return Some(Ok(SnapshotEntry {
                        id,
                        value: payload[sub.offset..sub.offset + sub.len].to_vec(),
                        version: slot.version(),
                        frequency: slot.frequency(),
                    }));
                }
                // Compacted away or promoted since the id list was taken.
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Dump of the whole store: memory tiers eagerly, SSD-only ids lazily.
pub struct Snapshot {
    pub keys: Vec<i64>,
    /// Row-major `[keys.len(), value_len]`, primary embeddings only.
    pub values: Vec<f32>,
    pub versions: Vec<i64>,
    pub freqs: Vec<i64>,
    pub ssd_remainder: SsdRemainderIter,
}

pub struct EmbeddingVariable {
    name: String,
    config: EmbeddingConfig,
    layout: SlotLayout,
    storage: LayeredStorage,
}

impl EmbeddingVariable {
    pub fn new(name: impl Into<String>, config: EmbeddingConfig) -> Result<EmbeddingVariable> {
        Self::with_hbm_allocator(name, config, None)
    }

    /// HBM storage types need the embedder to inject the device
    /// allocator; everything else ignores it.
    pub fn with_hbm_allocator(
        name: impl Into<String>,
        config: EmbeddingConfig,
        hbm_allocator: Option<Arc<dyn ByteAllocator>>,
    ) -> Result<EmbeddingVariable> {
        let storage = LayeredStorage::new(&config, hbm_allocator)?;
        let layout = storage.layout().clone();
        Ok(EmbeddingVariable {
            name: name.into(),
            config,
            layout,
            storage,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn value_len(&self) -> usize {
        self.config.value_len
    }

    pub fn stats(&self) -> CacheStats {
        self.storage.stats()
    }

    fn check_id(&self, id: i64) -> Result<()> {
        if is_reserved_key(id) {
            return Err(Error::invalid(format!("id {id} is reserved")));
        }
        Ok(())
    }

    fn check_default(&self, default_value: Option<&[f32]>) -> Result<()> {
        if let Some(d) = default_value {
            if d.len() != self.config.value_len {
                return Err(Error::invalid(format!(
                    "default value has {} floats, variable holds {}",
                    d.len(),
                    self.config.value_len
                )));
            }
        }
        Ok(())
    }

    fn value_ref(&self, handle: SlotHandle) -> ValueRef {
        ValueRef {
            handle,
            primary: self.layout.primary(),
        }
    }

    /// The fast path. A `None` default signals filter-only access: the
    /// observation is recorded but nothing is created and nothing may be
    /// written.
    pub fn lookup_or_create(&self, id: i64, default_value: Option<&[f32]>) -> Result<Lookup> {
        self.lookup_with_count(id, default_value, 1)
    }

    fn lookup_with_count(
        &self,
        id: i64,
        default_value: Option<&[f32]>,
        count: i64,
    ) -> Result<Lookup> {
        self.check_id(id)?;
        self.check_default(default_value)?;
        let outcome = self
            .storage
            .lookup_or_create(id, count, default_value.is_some())?;
        let handle = match outcome {
            LookupOutcome::Filtered => return Ok(Lookup::Filtered),
            LookupOutcome::Hit(h) | LookupOutcome::Created(h) => h,
        };
        let slot = unsafe { handle.slot() };
        if let Some(default) = default_value {
            // First sight of this sub-embedding (fresh create, shadow
            // upgrade, or a racing creator that has not finished): the
            // default lands exactly once.
            if !slot.is_initialized(0) {
                let sub = self.layout.primary();
                let payload = unsafe { slot.payload_slice_mut() };
                payload[sub.offset..sub.offset + sub.len].copy_from_slice(default);
                slot.mark_initialized(0);
            }
        }
        Ok(Lookup::Admitted(self.value_ref(handle)))
    }

    /// Batched fast path: each distinct id is observed once with its
    /// multiplicity in `ids`, and results come back in input order.
    pub fn lookup_or_create_batch(
        &self,
        ids: &[i64],
        default_value: Option<&[f32]>,
    ) -> Result<Vec<Lookup>> {
        let mut multiplicity: HashMap<i64, i64> = HashMap::new();
        for &id in ids {
            *multiplicity.entry(id).or_insert(0) += 1;
        }
        let mut first: HashMap<i64, Lookup> = HashMap::with_capacity(multiplicity.len());
        for (&id, &count) in multiplicity.iter() {
            first.insert(id, self.lookup_with_count(id, default_value, count)?);
        }
        Ok(ids
            .iter()
            .map(|id| match &first[id] {
                Lookup::Admitted(v) => Lookup::Admitted(*v),
                Lookup::Filtered => Lookup::Filtered,
            })
            .collect())
    }

    /// Header-interleaving optimizer variants: the raw handle plus the
    /// admission verdict. A bloom-filtered id has no slot and surfaces
    /// as `NotFound`.
    pub fn lookup_or_create_key(&self, id: i64) -> Result<(SlotHandle, bool)> {
        self.check_id(id)?;
        match self.storage.lookup_or_create(id, 1, true)? {
            LookupOutcome::Hit(h) | LookupOutcome::Created(h) => {
                let admitted = !unsafe { h.slot() }.is_shadow();
                Ok((h, admitted))
            }
            LookupOutcome::Filtered => match self.storage.core().mem_tiers()[0].get(id) {
                Some(h) => Ok((h, false)),
                None => Err(Error::NotFound),
            },
        }
    }

    /// Records the global training step on a slot.
    pub fn update_version(&self, handle: SlotHandle, step: i64) -> Result<()> {
        let slot = unsafe { handle.slot() };
        if slot.is_shadow() {
            return Err(Error::precondition(
                "optimizer update on a not-yet-admitted id",
            ));
        }
        slot.update_version(step);
        Ok(())
    }

    /// Seeds ids expected hot soon; commit them with `add_to_cache`.
    pub fn add_to_prefetch_list(&self, ids: &[i64]) {
        self.storage.add_to_prefetch_list(ids);
    }

    pub fn add_to_cache(&self, ids: &[i64]) {
        self.storage.add_to_cache(ids);
    }

    /// Admitted ids across all tiers; shadows do not count.
    pub fn size(&self) -> usize {
        let core = self.storage.core();
        let mut n = 0usize;
        for tier in core.mem_tiers() {
            tier.for_each(|_, handle| {
                if !unsafe { handle.slot() }.is_shadow() {
                    n += 1;
                }
            });
        }
        n + core.ssd_tier().map_or(0, |t| t.size())
    }

    pub fn contains(&self, id: i64) -> bool {
        self.storage.contains(id)
    }

    /// Explicit removal across every tier.
    pub fn remove(&self, id: i64) -> bool {
        self.storage.remove(id)
    }

    /// Assembles a dump of all ids. Memory tiers are captured eagerly;
    /// ids living only on SSD stream through `ssd_remainder`.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let core = self.storage.core();
        let sub = self.layout.primary();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut versions = Vec::new();
        let mut freqs = Vec::new();
        let mut in_memory = hashbrown::HashSet::new();

        for tier in core.mem_tiers() {
            tier.for_each(|id, handle| {
                let slot = unsafe { handle.slot() };
                in_memory.insert(id);
                if slot.is_shadow() {
                    return;
                }
                let payload = unsafe { slot.payload_slice() };
                keys.push(id);
                values.extend_from_slice(&payload[sub.offset..sub.offset + sub.len]);
                versions.push(slot.version());
                freqs.push(slot.frequency());
            });
        }

        let ssd_ids: Vec<i64> = core
            .ssd_tier()
            .map(|t| {
                t.keys()
                    .into_iter()
                    .filter(|id| !in_memory.contains(id))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Snapshot {
            keys,
            values,
            versions,
            freqs,
            ssd_remainder: SsdRemainderIter {
                core: Arc::clone(core),
                ids: ssd_ids,
                pos: 0,
            },
        })
    }

    /// Prunes ids by step TTL and/or L2 weight, as configured. Runs
    /// under per-tier exclusive locks. Returns the removed count.
    ///
    /// Step TTL keeps exactly the ids with
    /// `version > global_step - steps_to_live`; the L2 rule keeps ids
    /// whose primary sum-of-squares reaches `l2_weight_threshold`.
    pub fn shrink(&self, global_step: i64) -> Result<usize> {
        let steps_to_live = self.config.steps_to_live;
        let l2_threshold = self.config.l2_weight_threshold;
        if steps_to_live <= 0 && l2_threshold < 0.0 {
            return Ok(0);
        }
        let layout = &self.layout;
        self.storage.shrink(move |_, slot| {
            if slot.is_shadow() {
                return false;
            }
            if steps_to_live > 0 && slot.version() <= global_step - steps_to_live {
                return true;
            }
            l2_threshold >= 0.0 && slot.primary_l2_weight(layout) < l2_threshold
        })
    }

    /// Emits this shard's nine checkpoint tensors.
    pub fn export(&self, partition_id: usize) -> Result<CheckpointBundle> {
        let mut admitted = ShardEntries::default();
        let mut filtered = ShardEntries::default();
        let sub = self.layout.primary();

        let core = self.storage.core();
        let mut in_memory = hashbrown::HashSet::new();
        for tier in core.mem_tiers() {
            tier.for_each(|id, handle| {
                let slot = unsafe { handle.slot() };
                in_memory.insert(id);
                if slot.is_shadow() {
                    filtered.push(id, &[], slot.version(), slot.frequency());
                } else {
                    let payload = unsafe { slot.payload_slice() };
                    admitted.push(
                        id,
                        &payload[sub.offset..sub.offset + sub.len],
                        slot.version(),
                        slot.frequency(),
                    );
                }
            });
        }
        if let Some(ssd) = core.ssd_tier() {
            for id in ssd.keys() {
                if in_memory.contains(&id) {
                    continue;
                }
                if let Some(slot) = ssd.get(id)? {
                    let payload = unsafe { slot.payload_slice() };
                    admitted.push(
                        id,
                        &payload[sub.offset..sub.offset + sub.len],
                        slot.version(),
                        slot.frequency(),
                    );
                }
            }
        }

        Ok(build_shard(
            &self.name,
            partition_id,
            self.config.value_len,
            admitted,
            filtered,
        ))
    }

    /// Restores this shard from a checkpoint bundle, keeping only the
    /// ids routed to `partition_id` of `partition_num`.
    pub fn import(
        &self,
        bundle: &CheckpointBundle,
        partition_id: usize,
        partition_num: usize,
    ) -> Result<()> {
        let (admitted, filtered) = parse_shard(bundle, &self.name, partition_id)?;
        let value_len = self.config.value_len;
        let core = self.storage.core();

        for (i, &id) in admitted.keys.iter().enumerate() {
            if !belongs_to_partition(id, partition_id, partition_num) {
                continue;
            }
            let row = &admitted.values[i * value_len..(i + 1) * value_len];
            core.import_full(id, row, admitted.versions[i], admitted.freqs[i])?;
        }
        for (i, &id) in filtered.keys.iter().enumerate() {
            if !belongs_to_partition(id, partition_id, partition_num) {
                continue;
            }
            core.import_filtered(id, filtered.versions[i], filtered.freqs[i])?;
        }
        Ok(())
    }

    /// One synchronous eviction sweep (the background evictor does this
    /// on its own; tests call it for determinism).
    pub fn run_eviction_pass(&self) {
        self.storage.run_eviction_pass();
    }

    /// Spills memory tiers to SSD, if present.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    /// Drains background tasks and seals the SSD log.
    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}
