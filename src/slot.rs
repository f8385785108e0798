//! Per-id stored state: a small atomic header plus a fixed-length,
//! 16-byte-aligned float payload.
//!
//! The payload pointer, once set, is stable until the slot is destroyed or
//! migrated; migration is always copy-then-publish, never an in-place
//! relocation. The store never rewrites payload bytes on its own — callers
//! own the read-modify-write cycle on the slots they hold.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;

/// Payload alignment in bytes, so vectorized optimizer kernels read
/// aligned memory.
pub const PAYLOAD_ALIGN: usize = 16;

/// Floats per alignment unit.
pub const FLOATS_PER_ALIGN: usize = PAYLOAD_ALIGN / 4;

/// Upper bound on co-located sub-embeddings; one init bit each.
pub const MAX_SUB_EMBEDDINGS: usize = 16;

bitflags! {
    /// Flag word of a slot. Bits 0..16 are per-sub-embedding
    /// initialization bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        const FROZEN         = 1 << 16;
        const IN_MEMORY_POOL = 1 << 17;
        /// Observed but not yet admitted; header only, no payload.
        const SHADOW         = 1 << 18;

        const _ = !0;
    }
}

impl SlotFlags {
    /// The initialization bit for sub-embedding `index`.
    pub fn init_bit(index: usize) -> SlotFlags {
        debug_assert!(index < MAX_SUB_EMBEDDINGS);
        SlotFlags::from_bits_retain(1 << index)
    }
}

/// Which tier currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TierTag {
    Hbm = 0,
    Dram = 1,
    SsdCached = 2,
}

impl TierTag {
    fn from_u8(v: u8) -> TierTag {
        match v {
            0 => TierTag::Hbm,
            1 => TierTag::Dram,
            _ => TierTag::SsdCached,
        }
    }
}

/// What the caller must do with a handle returned from a lower tier.
///
/// Carried explicitly next to the handle on the return path; no pointer
/// bits are stolen to encode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyBackHint {
    /// Hit at the top tier; use in place.
    None,
    /// Hit at a lower in-memory tier; promote by copy.
    CopyBack,
    /// Hit at the SSD tier; promote by copy, then destroy the transient.
    CopyBackAndDestroy,
}

/// Sub-embedding placement inside one payload, in float offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubEmbedding {
    pub offset: usize,
    pub len: usize,
}

/// Describes how sub-embeddings (primary value, optimizer slots such as
/// Adam's m and v) are packed inside one payload.
#[derive(Debug, Clone)]
pub struct SlotLayout {
    subs: Vec<SubEmbedding>,
    total_dims: usize,
}

fn align_floats(len: usize) -> usize {
    len.div_ceil(FLOATS_PER_ALIGN) * FLOATS_PER_ALIGN
}

impl SlotLayout {
    /// Every sub-embedding starts at an aligned offset.
    pub fn normal(value_len: usize, slot_count: usize) -> SlotLayout {
        let aligned = align_floats(value_len);
        let subs = (0..slot_count)
            .map(|i| SubEmbedding {
                offset: i * aligned,
                len: value_len,
            })
            .collect();
        SlotLayout {
            subs,
            total_dims: slot_count * aligned,
        }
    }

    /// Primary value only.
    pub fn light(value_len: usize) -> SlotLayout {
        SlotLayout::normal(value_len, 1)
    }

    /// Sub-embeddings packed back to back; only the payload end is padded
    /// out to the alignment unit.
    pub fn normal_contiguous(value_len: usize, slot_count: usize) -> SlotLayout {
        let subs = (0..slot_count)
            .map(|i| SubEmbedding {
                offset: i * value_len,
                len: value_len,
            })
            .collect();
        SlotLayout {
            subs,
            total_dims: align_floats(slot_count * value_len),
        }
    }

    pub fn from_config(cfg: &crate::config::EmbeddingConfig) -> SlotLayout {
        match cfg.layout {
            crate::config::LayoutKind::Normal => SlotLayout::normal(cfg.value_len, cfg.slot_count),
            crate::config::LayoutKind::Light => SlotLayout::light(cfg.value_len),
            crate::config::LayoutKind::NormalContiguous => {
                SlotLayout::normal_contiguous(cfg.value_len, cfg.slot_count)
            }
        }
    }

    /// Total floats in one payload, alignment included.
    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// Payload size in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.total_dims * 4
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    pub fn sub(&self, index: usize) -> SubEmbedding {
        self.subs[index]
    }

    /// The primary embedding's placement.
    pub fn primary(&self) -> SubEmbedding {
        self.subs[0]
    }
}

/// Header + payload for one stored id.
///
/// Header fields are atomics so lookups, eviction ranking and checkpoint
/// iteration can read them without coordination. `version` is monotonically
/// non-decreasing; `frequency` is a relaxed saturating counter.
pub struct ValueSlot {
    flags: AtomicU32,
    tier: AtomicU8,
    version: AtomicI64,
    frequency: AtomicI64,
    payload: AtomicPtr<f32>,
    total_dims: usize,
    /// Transient SSD materializations own their payload allocation;
    /// pooled slots return theirs to the tier pool.
    owns_payload: bool,
}

// Payload pointers are only dereferenced under the handle-lifetime
// contract; the header is all atomics.
unsafe impl Send for ValueSlot {}
unsafe impl Sync for ValueSlot {}

impl ValueSlot {
    /// A slot whose payload buffer came from a tier `MemoryPool`.
    pub fn pooled(payload: NonNull<f32>, total_dims: usize, tier: TierTag) -> ValueSlot {
        ValueSlot {
            flags: AtomicU32::new(SlotFlags::IN_MEMORY_POOL.bits()),
            tier: AtomicU8::new(tier as u8),
            version: AtomicI64::new(-1),
            frequency: AtomicI64::new(0),
            payload: AtomicPtr::new(payload.as_ptr()),
            total_dims,
            owns_payload: false,
        }
    }

    /// A header-only shadow slot for an id below the admission threshold.
    pub fn shadow(total_dims: usize, tier: TierTag) -> ValueSlot {
        ValueSlot {
            flags: AtomicU32::new(SlotFlags::SHADOW.bits()),
            tier: AtomicU8::new(tier as u8),
            version: AtomicI64::new(-1),
            frequency: AtomicI64::new(0),
            payload: AtomicPtr::new(std::ptr::null_mut()),
            total_dims,
            owns_payload: false,
        }
    }

    /// A transient slot materialized from an SSD record; owns its payload.
    pub fn transient(payload: Box<[f32]>, tier: TierTag) -> ValueSlot {
        let total_dims = payload.len();
        let ptr = Box::into_raw(payload) as *mut f32;
        ValueSlot {
            flags: AtomicU32::new(0),
            tier: AtomicU8::new(tier as u8),
            version: AtomicI64::new(-1),
            frequency: AtomicI64::new(0),
            payload: AtomicPtr::new(ptr),
            total_dims,
            owns_payload: true,
        }
    }

    pub fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: SlotFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: SlotFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_shadow(&self) -> bool {
        self.flags().contains(SlotFlags::SHADOW)
    }

    pub fn is_initialized(&self, sub_index: usize) -> bool {
        self.flags().contains(SlotFlags::init_bit(sub_index))
    }

    pub fn mark_initialized(&self, sub_index: usize) {
        self.set_flags(SlotFlags::init_bit(sub_index));
    }

    pub fn tier(&self) -> TierTag {
        TierTag::from_u8(self.tier.load(Ordering::Relaxed))
    }

    pub fn set_tier(&self, tier: TierTag) {
        self.tier.store(tier as u8, Ordering::Relaxed);
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Monotonic: a stale step never rolls the version back.
    pub fn update_version(&self, step: i64) {
        self.version.fetch_max(step, Ordering::AcqRel);
    }

    pub fn frequency(&self) -> i64 {
        self.frequency.load(Ordering::Relaxed)
    }

    /// Relaxed saturating add, capped at `max_freq`.
    pub fn add_frequency(&self, count: i64, max_freq: i64) -> i64 {
        let mut cur = self.frequency.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(count).min(max_freq);
            match self.frequency.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Restores header fields from a checkpoint or SSD record.
    pub fn restore_header(&self, version: i64, frequency: i64) {
        self.version.store(version, Ordering::Release);
        self.frequency.store(frequency, Ordering::Relaxed);
    }

    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// Null while the slot is a shadow.
    pub fn payload_ptr(&self) -> *mut f32 {
        self.payload.load(Ordering::Acquire)
    }

    pub fn has_payload(&self) -> bool {
        !self.payload_ptr().is_null()
    }

    /// Publishes a pool buffer into a shadow slot, upgrading it to a full
    /// member. Returns false if another thread won the upgrade.
    pub fn publish_payload(&self, payload: NonNull<f32>) -> bool {
        let won = self
            .payload
            .compare_exchange(
                std::ptr::null_mut(),
                payload.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.set_flags(SlotFlags::IN_MEMORY_POOL);
            self.clear_flags(SlotFlags::SHADOW);
        }
        won
    }

    /// Detaches the payload pointer, leaving the slot empty. The caller
    /// becomes responsible for the buffer.
    pub fn take_payload(&self) -> Option<NonNull<f32>> {
        NonNull::new(self.payload.swap(std::ptr::null_mut(), Ordering::AcqRel))
    }

    /// # Safety
    /// The slot must have a payload, and the caller must honor the
    /// handle-lifetime contract (no reads concurrent with destruction).
    pub unsafe fn payload_slice(&self) -> &[f32] {
        std::slice::from_raw_parts(self.payload_ptr(), self.total_dims)
    }

    /// # Safety
    /// As `payload_slice`; additionally the caller owns the
    /// read-modify-write cycle for this id.
    pub unsafe fn payload_slice_mut(&self) -> &mut [f32] {
        std::slice::from_raw_parts_mut(self.payload_ptr(), self.total_dims)
    }

    /// Copies `src` into the payload. `src` must not exceed the payload.
    pub fn write_payload(&self, src: &[f32]) {
        debug_assert!(src.len() <= self.total_dims);
        let ptr = self.payload_ptr();
        debug_assert!(!ptr.is_null());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
        }
    }

    /// Copies the whole header + payload of `src` into this slot.
    /// Used by copy-back promotion; both slots must share a layout.
    pub fn copy_from(&self, src: &ValueSlot) {
        debug_assert_eq!(self.total_dims, src.total_dims);
        self.version.store(src.version(), Ordering::Release);
        self.frequency.store(src.frequency(), Ordering::Relaxed);
        // Carry init bits and FROZEN; tier and pool-membership stay ours.
        let carried = src.flags()
            & (SlotFlags::from_bits_retain((1 << MAX_SUB_EMBEDDINGS) - 1) | SlotFlags::FROZEN);
        self.set_flags(carried);
        if src.has_payload() && self.has_payload() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.payload_ptr() as *const f32,
                    self.payload_ptr(),
                    self.total_dims,
                );
            }
        }
    }

    /// L2 weight (sum of squares) of the primary sub-embedding; this is
    /// the quantity the shrink threshold compares against.
    pub fn primary_l2_weight(&self, layout: &SlotLayout) -> f32 {
        if !self.has_payload() {
            return 0.0;
        }
        let sub = layout.primary();
        let payload = unsafe { self.payload_slice() };
        payload[sub.offset..sub.offset + sub.len]
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
    }
}

impl Drop for ValueSlot {
    fn drop(&mut self) {
        if self.owns_payload {
            let ptr = *self.payload.get_mut();
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(
                        ptr,
                        self.total_dims,
                    )));
                }
            }
        }
    }
}

/// Opaque reference to a slot, valid until the slot is destroyed or
/// migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle(NonNull<ValueSlot>);

unsafe impl Send for SlotHandle {}
unsafe impl Sync for SlotHandle {}

impl SlotHandle {
    pub fn from_box(slot: Box<ValueSlot>) -> SlotHandle {
        // Box pointers are never null.
        SlotHandle(unsafe { NonNull::new_unchecked(Box::into_raw(slot)) })
    }

    pub fn from_raw(ptr: *mut ValueSlot) -> Option<SlotHandle> {
        NonNull::new(ptr).map(SlotHandle)
    }

    pub fn as_ptr(&self) -> *mut ValueSlot {
        self.0.as_ptr()
    }

    /// # Safety
    /// The slot must still be alive (handle-lifetime contract).
    pub unsafe fn slot<'a>(&self) -> &'a ValueSlot {
        &*self.0.as_ptr()
    }

    /// # Safety
    /// As `slot`, and no other owner may free the slot concurrently.
    pub unsafe fn into_box(self) -> Box<ValueSlot> {
        Box::from_raw(self.0.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_layout_aligns_each_sub() {
        let l = SlotLayout::normal(3, 3);
        assert_eq!(l.total_dims(), 12);
        assert_eq!(l.sub(0), SubEmbedding { offset: 0, len: 3 });
        assert_eq!(l.sub(1), SubEmbedding { offset: 4, len: 3 });
        assert_eq!(l.sub(2), SubEmbedding { offset: 8, len: 3 });
    }

    #[test]
    fn contiguous_layout_packs_subs() {
        let l = SlotLayout::normal_contiguous(3, 3);
        assert_eq!(l.sub(1), SubEmbedding { offset: 3, len: 3 });
        // 9 floats padded to the next alignment unit.
        assert_eq!(l.total_dims(), 12);
    }

    #[test]
    fn version_is_monotone() {
        let slot = ValueSlot::shadow(4, TierTag::Dram);
        slot.update_version(10);
        slot.update_version(7);
        assert_eq!(slot.version(), 10);
        slot.update_version(11);
        assert_eq!(slot.version(), 11);
    }

    #[test]
    fn frequency_saturates_at_cap() {
        let slot = ValueSlot::shadow(4, TierTag::Dram);
        assert_eq!(slot.add_frequency(5, 8), 5);
        assert_eq!(slot.add_frequency(5, 8), 8);
        assert_eq!(slot.frequency(), 8);
    }

    #[test]
    fn init_bits_are_per_sub() {
        let slot = ValueSlot::shadow(4, TierTag::Dram);
        assert!(!slot.is_initialized(0));
        slot.mark_initialized(0);
        slot.mark_initialized(2);
        assert!(slot.is_initialized(0));
        assert!(!slot.is_initialized(1));
        assert!(slot.is_initialized(2));
    }

    #[test]
    fn shadow_upgrade_races_once() {
        let slot = ValueSlot::shadow(4, TierTag::Dram);
        let mut a = [0f32; 4];
        let mut b = [0f32; 4];
        let pa = NonNull::new(a.as_mut_ptr()).unwrap();
        let pb = NonNull::new(b.as_mut_ptr()).unwrap();
        assert!(slot.publish_payload(pa));
        assert!(!slot.publish_payload(pb));
        assert!(!slot.is_shadow());
        assert_eq!(slot.payload_ptr(), a.as_mut_ptr());
        // Detach before the stack buffer goes away.
        slot.take_payload();
    }

    #[test]
    fn transient_owns_payload() {
        let payload = vec![1.0f32; 8].into_boxed_slice();
        let slot = ValueSlot::transient(payload, TierTag::SsdCached);
        assert_eq!(unsafe { slot.payload_slice() }[0], 1.0);
        drop(slot); // must free the boxed payload without leaking
    }

    #[test]
    fn copy_from_carries_header_and_payload() {
        let src = ValueSlot::transient(vec![2.0f32; 4].into_boxed_slice(), TierTag::SsdCached);
        src.update_version(42);
        src.add_frequency(3, i64::MAX);
        src.mark_initialized(0);

        let dst = ValueSlot::transient(vec![0.0f32; 4].into_boxed_slice(), TierTag::Dram);
        dst.copy_from(&src);
        assert_eq!(dst.version(), 42);
        assert_eq!(dst.frequency(), 3);
        assert!(dst.is_initialized(0));
        assert_eq!(unsafe { dst.payload_slice() }, &[2.0; 4]);
    }
}
