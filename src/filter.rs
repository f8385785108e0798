//! Admission filtering: suppress slot creation for ids seen fewer than
//! `filter_freq` times, keeping memory bounded over long-tailed id spaces.
//!
//! Two policies. The counting bloom filter keeps its own flat counter
//! array and may over-admit, never under-admit. The frequency-threshold
//! policy reuses the per-slot frequency counter; below threshold the slot
//! exists as a shadow (reads get the caller default, the optimizer may
//! not touch it). Both are monotone: once admitted, an id stays admitted
//! until it is explicitly removed.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::config::{CounterType, EmbeddingConfig};
use crate::slot::ValueSlot;

// Seeds for the two independent hash states behind double hashing.
const H1_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);
const H2_SEEDS: (u64, u64, u64, u64) = (
    0x4528_21e6_38d0_1377,
    0xbe54_66cf_34e9_0c6c,
    0xc0ac_29b7_c97c_50dd,
    0x3f84_d5b5_b547_0917,
);

macro_rules! saturating_cell_add {
    ($cells:expr, $idx:expr, $count:expr, $ty:ty) => {{
        let cell = &$cells[$idx];
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add($count as $ty);
            match cell.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break next as u64,
                Err(observed) => cur = observed,
            }
        }
    }};
}

/// Counter array at the configured cell width.
enum CounterArray {
    U8(Box<[AtomicU8]>),
    U16(Box<[AtomicU16]>),
    U32(Box<[AtomicU32]>),
    U64(Box<[AtomicU64]>),
}

impl CounterArray {
    fn new(kind: CounterType, len: usize) -> CounterArray {
        match kind {
            CounterType::U8 => CounterArray::U8((0..len).map(|_| AtomicU8::new(0)).collect()),
            CounterType::U16 => CounterArray::U16((0..len).map(|_| AtomicU16::new(0)).collect()),
            CounterType::U32 => CounterArray::U32((0..len).map(|_| AtomicU32::new(0)).collect()),
            CounterType::U64 => CounterArray::U64((0..len).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    /// Relaxed add with saturation at the cell width; returns the new value.
    fn add(&self, idx: usize, count: u64) -> u64 {
        match self {
            CounterArray::U8(c) => saturating_cell_add!(c, idx, count.min(u8::MAX as u64), u8),
            CounterArray::U16(c) => saturating_cell_add!(c, idx, count.min(u16::MAX as u64), u16),
            CounterArray::U32(c) => saturating_cell_add!(c, idx, count.min(u32::MAX as u64), u32),
            CounterArray::U64(c) => saturating_cell_add!(c, idx, count, u64),
        }
    }

    fn get(&self, idx: usize) -> u64 {
        match self {
            CounterArray::U8(c) => c[idx].load(Ordering::Relaxed) as u64,
            CounterArray::U16(c) => c[idx].load(Ordering::Relaxed) as u64,
            CounterArray::U32(c) => c[idx].load(Ordering::Relaxed) as u64,
            CounterArray::U64(c) => c[idx].load(Ordering::Relaxed),
        }
    }

    fn len(&self) -> usize {
        match self {
            CounterArray::U8(c) => c.len(),
            CounterArray::U16(c) => c.len(),
            CounterArray::U32(c) => c.len(),
            CounterArray::U64(c) => c.len(),
        }
    }
}

/// Counting bloom filter with k hash functions over an m-cell counter
/// array. Sized from the expected element count and the target false
/// positive probability.
pub struct CountingBloomFilter {
    cells: CounterArray,
    num_hashes: usize,
    threshold: u64,
    h1: ahash::RandomState,
    h2: ahash::RandomState,
}

impl CountingBloomFilter {
    pub fn new(
        expected_elements: usize,
        false_positive_probability: f64,
        counter_type: CounterType,
        threshold: u64,
    ) -> CountingBloomFilter {
        let n = expected_elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * false_positive_probability.ln()) / (ln2 * ln2)).ceil() as usize;
        let k = ((m as f64 / n) * ln2).round().max(1.0) as usize;
        let (a0, a1, a2, a3) = H1_SEEDS;
        let (b0, b1, b2, b3) = H2_SEEDS;
        CountingBloomFilter {
            cells: CounterArray::new(counter_type, m.max(8)),
            num_hashes: k,
            threshold,
            h1: ahash::RandomState::with_seeds(a0, a1, a2, a3),
            h2: ahash::RandomState::with_seeds(b0, b1, b2, b3),
        }
    }

    /// The k cell indices for `id` (double hashing; the step is forced
    /// odd so every probe sequence covers the array).
    pub fn cell_indices(&self, id: i64) -> Vec<usize> {
        let m = self.cells.len() as u64;
        let base = self.h1.hash_one(id);
        let step = self.h2.hash_one(id) | 1;
        (0..self.num_hashes)
            .map(|i| (base.wrapping_add(step.wrapping_mul(i as u64)) % m) as usize)
            .collect()
    }

    /// Adds `count` to every cell of `id` and reports whether the id has
    /// crossed the admission threshold (all k cells at or above it).
    pub fn observe(&self, id: i64, count: i64) -> bool {
        let count = count.max(1) as u64;
        let mut min = u64::MAX;
        for idx in self.cell_indices(id) {
            min = min.min(self.cells.add(idx, count));
        }
        min >= self.threshold
    }

    /// Read-only admission check.
    pub fn is_admitted(&self, id: i64) -> bool {
        self.cell_indices(id)
            .into_iter()
            .all(|idx| self.cells.get(idx) >= self.threshold)
    }

    pub fn cell_value(&self, idx: usize) -> u64 {
        self.cells.get(idx)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn hash_count(&self) -> usize {
        self.num_hashes
    }
}

/// Admission by the slot's own frequency counter; used with shadow slots.
pub struct FrequencyThreshold {
    threshold: i64,
    max_freq: i64,
}

impl FrequencyThreshold {
    pub fn new(threshold: u64, max_freq: i64) -> FrequencyThreshold {
        FrequencyThreshold {
            threshold: threshold as i64,
            max_freq,
        }
    }

    /// Records `count` accesses on the slot and reports admission.
    pub fn observe(&self, slot: &ValueSlot, count: i64) -> bool {
        slot.add_frequency(count.max(1), self.max_freq) >= self.threshold
    }

    pub fn is_admitted(&self, slot: &ValueSlot) -> bool {
        slot.frequency() >= self.threshold
    }
}

pub enum AdmissionPolicy {
    /// No filtering; every id gets a slot on first sight.
    Always,
    Bloom(CountingBloomFilter),
    Frequency(FrequencyThreshold),
}

impl AdmissionPolicy {
    pub fn from_config(cfg: &EmbeddingConfig) -> AdmissionPolicy {
        if cfg.filter_freq == 0 {
            AdmissionPolicy::Always
        } else if cfg.use_counter_filter {
            AdmissionPolicy::Frequency(FrequencyThreshold::new(cfg.filter_freq, cfg.max_freq))
        } else {
            AdmissionPolicy::Bloom(CountingBloomFilter::new(
                cfg.max_element_size,
                cfg.false_positive_probability,
                cfg.counter_type,
                cfg.filter_freq,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::TierTag;
    use std::sync::Arc;

    fn bloom(threshold: u64, counter_type: CounterType) -> CountingBloomFilter {
        CountingBloomFilter::new(10_000, 0.01, counter_type, threshold)
    }

    #[test]
    fn sizing_follows_standard_formulas() {
        let f = bloom(1, CounterType::U32);
        // n=10_000, p=0.01 → m ≈ 95_851, k ≈ 7.
        assert!((95_000..97_000).contains(&f.cell_count()));
        assert_eq!(f.hash_count(), 7);
    }

    #[test]
    fn admits_after_threshold_crossings() {
        let f = bloom(3, CounterType::U32);
        assert!(!f.observe(99, 1));
        assert!(!f.observe(99, 1));
        assert!(f.observe(99, 1));
    }

    #[test]
    fn batched_count_crosses_in_one_observe() {
        let f = bloom(5, CounterType::U16);
        assert!(f.observe(7, 5));
    }

    #[test]
    fn admission_is_monotone() {
        let f = bloom(2, CounterType::U8);
        while !f.observe(1234, 1) {}
        for _ in 0..100 {
            assert!(f.observe(1234, 1));
            assert!(f.is_admitted(1234));
        }
    }

    #[test]
    fn narrow_counters_saturate_instead_of_wrapping() {
        let f = bloom(1, CounterType::U8);
        for _ in 0..300 {
            f.observe(5, 1);
        }
        for idx in f.cell_indices(5) {
            assert_eq!(f.cell_value(idx), u8::MAX as u64);
        }
        assert!(f.is_admitted(5));
    }

    // Four threads each observe ids 1..=4 once; every cell must end at
    // exactly the number of times it appears across the ids' hash sets.
    fn concurrent_counts_settle(counter_type: CounterType) {
        let f = Arc::new(bloom(100, counter_type));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    for id in 1..=4 {
                        f.observe(id, 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut expected = std::collections::HashMap::new();
        for id in 1..=4 {
            for idx in f.cell_indices(id) {
                *expected.entry(idx).or_insert(0u64) += 4;
            }
        }
        for (idx, count) in expected {
            assert_eq!(f.cell_value(idx), count, "cell {idx}");
        }
    }

    #[test]
    fn concurrent_counts_settle_all_widths() {
        for ct in [
            CounterType::U8,
            CounterType::U16,
            CounterType::U32,
            CounterType::U64,
        ] {
            concurrent_counts_settle(ct);
        }
    }

    #[test]
    fn frequency_threshold_uses_slot_counter() {
        let policy = FrequencyThreshold::new(3, i64::MAX);
        let slot = ValueSlot::shadow(4, TierTag::Dram);
        assert!(!policy.observe(&slot, 1));
        assert!(!policy.observe(&slot, 1));
        assert!(policy.observe(&slot, 1));
        assert!(policy.is_admitted(&slot));
        assert_eq!(slot.frequency(), 3);
    }

    #[test]
    fn policy_from_config() {
        let cfg = crate::config::EmbeddingConfig::new(4);
        assert!(matches!(
            AdmissionPolicy::from_config(&cfg),
            AdmissionPolicy::Always
        ));
        let cfg = cfg.with_filter_freq(2);
        assert!(matches!(
            AdmissionPolicy::from_config(&cfg),
            AdmissionPolicy::Bloom(_)
        ));
        let mut cfg = cfg;
        cfg.use_counter_filter = true;
        assert!(matches!(
            AdmissionPolicy::from_config(&cfg),
            AdmissionPolicy::Frequency(_)
        ));
    }
}
