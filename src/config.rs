//! Store configuration.
//!
//! A single `EmbeddingConfig` describes the tier stack, the slot layout,
//! the admission filter and the SSD log. It is validated once at
//! construction; environment knobs (`SSDHASH_ASYNC_COMPACTION`,
//! `SSDHASH_IO_SCHEME`) are read at the same point and never again.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Which tier stack to build, top tier first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Dram,
    DramSsd,
    HbmDram,
    HbmDramSsd,
}

impl StorageType {
    pub fn has_hbm(&self) -> bool {
        matches!(self, StorageType::HbmDram | StorageType::HbmDramSsd)
    }

    pub fn has_ssd(&self) -> bool {
        matches!(self, StorageType::DramSsd | StorageType::HbmDramSsd)
    }

    /// Number of in-memory tiers in the stack.
    pub fn memory_tiers(&self) -> usize {
        if self.has_hbm() { 2 } else { 1 }
    }
}

/// Eviction ranking used by each in-memory tier's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    Lru,
    Lfu,
}

/// Counter cell width of the counting bloom filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterType {
    U8,
    U16,
    U32,
    U64,
}

impl CounterType {
    pub fn max_value(&self) -> u64 {
        match self {
            CounterType::U8 => u8::MAX as u64,
            CounterType::U16 => u16::MAX as u64,
            CounterType::U32 => u32::MAX as u64,
            CounterType::U64 => u64::MAX,
        }
    }
}

/// How sub-embeddings (primary value, optimizer slots) are packed inside
/// one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Each sub-embedding starts at a 16-byte-aligned offset.
    Normal,
    /// Primary value only; no optimizer slots are co-located.
    Light,
    /// Sub-embeddings packed back to back, padding only at the end.
    NormalContiguous,
}

/// SSD read scheme, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoScheme {
    /// Aligned `pread` on the segment fd.
    DirectIo,
    /// Lazy per-segment mmap; pages faulted on access.
    Mmap,
    /// As mmap, plus `madvise(WILLNEED)` on the containing range.
    MmapAndMadvise,
}

impl IoScheme {
    fn parse(s: &str) -> Option<IoScheme> {
        match s {
            "directio" => Some(IoScheme::DirectIo),
            "mmap" => Some(IoScheme::Mmap),
            "mmap_and_madvise" => Some(IoScheme::MmapAndMadvise),
            _ => None,
        }
    }
}

/// Reads `SSDHASH_IO_SCHEME`, defaulting to mmap on unknown or unset values.
pub fn io_scheme_from_env() -> IoScheme {
    std::env::var("SSDHASH_IO_SCHEME")
        .ok()
        .and_then(|v| IoScheme::parse(&v))
        .unwrap_or(IoScheme::Mmap)
}

/// Reads `SSDHASH_ASYNC_COMPACTION`, defaulting to true.
pub fn async_compaction_from_env() -> bool {
    match std::env::var("SSDHASH_ASYNC_COMPACTION") {
        Ok(v) => v != "false" && v != "0",
        Err(_) => true,
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub storage_type: StorageType,
    /// Per-tier byte capacities, top tier first. Unused entries ignored.
    pub size: [usize; 3],
    /// Floats in the primary embedding.
    pub value_len: usize,
    /// Co-located sub-embeddings (primary + optimizer slots).
    pub slot_count: usize,
    pub layout: LayoutKind,
    pub cache_strategy: CacheStrategy,

    /// Admission threshold; 0 disables filtering entirely.
    pub filter_freq: u64,
    /// Frequency counter saturation point.
    pub max_freq: i64,
    pub counter_type: CounterType,
    /// Expected distinct-id count used to size the bloom filter.
    pub max_element_size: usize,
    pub false_positive_probability: f64,
    /// When true, admission reuses the per-slot frequency counter instead
    /// of a bloom filter; below-threshold ids are stored as shadows.
    pub use_counter_filter: bool,

    /// Step TTL for shrink; 0 disables.
    pub steps_to_live: i64,
    /// L2 shrink threshold; negative disables.
    pub l2_weight_threshold: f32,

    /// Buffers carved per pool block.
    pub block_size: usize,
    /// Victims moved per eviction sweep.
    pub eviction_batch_size: usize,

    pub ssd_dir: Option<PathBuf>,
    pub segment_bytes: u64,
    /// Live fraction below which a sealed segment is compacted.
    /// Default 0.5.
    pub compaction_threshold: f64,
    /// Sealed-segment count that forces compaction of the oldest segment.
    pub max_sealed_segments: usize,
    pub async_compaction: bool,
    pub io_scheme: IoScheme,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            storage_type: StorageType::Dram,
            size: [64 << 20, 256 << 20, u64::MAX as usize >> 1],
            value_len: 0,
            slot_count: 1,
            layout: LayoutKind::Normal,
            cache_strategy: CacheStrategy::Lru,
            filter_freq: 0,
            max_freq: i64::MAX,
            counter_type: CounterType::U32,
            max_element_size: 1 << 20,
            false_positive_probability: 0.01,
            use_counter_filter: false,
            steps_to_live: 0,
            l2_weight_threshold: -1.0,
            block_size: 1024,
            eviction_batch_size: 4096,
            ssd_dir: None,
            segment_bytes: 64 << 20,
            compaction_threshold: 0.5,
            max_sealed_segments: 8,
            async_compaction: async_compaction_from_env(),
            io_scheme: io_scheme_from_env(),
        }
    }
}

impl EmbeddingConfig {
    pub fn new(value_len: usize) -> Self {
        EmbeddingConfig {
            value_len,
            ..Default::default()
        }
    }

    pub fn with_storage(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn with_cache_strategy(mut self, s: CacheStrategy) -> Self {
        self.cache_strategy = s;
        self
    }

    pub fn with_slot_count(mut self, n: usize) -> Self {
        self.slot_count = n;
        self
    }

    pub fn with_ssd_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ssd_dir = Some(dir.into());
        self
    }

    pub fn with_filter_freq(mut self, freq: u64) -> Self {
        self.filter_freq = freq;
        self
    }

    pub fn with_steps_to_live(mut self, steps: i64) -> Self {
        self.steps_to_live = steps;
        self
    }

    pub fn with_l2_weight_threshold(mut self, threshold: f32) -> Self {
        self.l2_weight_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.value_len == 0 {
            return Err(Error::invalid("value_len must be positive"));
        }
        if self.slot_count == 0 || self.slot_count > crate::slot::MAX_SUB_EMBEDDINGS {
            return Err(Error::invalid(format!(
                "slot_count {} outside 1..={}",
                self.slot_count,
                crate::slot::MAX_SUB_EMBEDDINGS
            )));
        }
        if self.layout == LayoutKind::Light && self.slot_count != 1 {
            return Err(Error::invalid("light layout admits a single sub-embedding"));
        }
        if self.storage_type.has_ssd() && self.ssd_dir.is_none() {
            return Err(Error::invalid("SSD tier requested without ssd_dir"));
        }
        if !(0.0..1.0).contains(&self.false_positive_probability)
            || self.false_positive_probability == 0.0
        {
            return Err(Error::invalid(
                "false_positive_probability must be in (0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(Error::invalid("compaction_threshold must be in [0, 1]"));
        }
        if self.segment_bytes < 1 << 16 {
            return Err(Error::invalid("segment_bytes too small"));
        }
        for tier in 0..self.storage_type.memory_tiers() {
            if self.size[tier] == 0 {
                return Err(Error::invalid(format!("tier {tier} capacity is zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_needs_value_len() {
        assert!(EmbeddingConfig::default().validate().is_err());
        assert!(EmbeddingConfig::new(8).validate().is_ok());
    }

    #[test]
    fn ssd_requires_dir() {
        let cfg = EmbeddingConfig::new(8).with_storage(StorageType::DramSsd);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
        let cfg = cfg.with_ssd_dir("/tmp/x");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn io_scheme_parse() {
        assert_eq!(IoScheme::parse("directio"), Some(IoScheme::DirectIo));
        assert_eq!(
            IoScheme::parse("mmap_and_madvise"),
            Some(IoScheme::MmapAndMadvise)
        );
        assert_eq!(IoScheme::parse("bogus"), None);
    }
}
