//! Tiered embedding key-value store for training very large sparse
//! models.
//!
//! Each feature id maps to a fixed-length float payload plus a small
//! header (version, frequency, flags, per-sub-embedding init bits). The
//! store is consulted on every training step to look up, lazily create,
//! update, evict, persist and restore these slots across a memory
//! hierarchy of device RAM, host RAM and SSD. Updates are performed in
//! place by the caller after lookup; the store provides lifetime and
//! placement guarantees only.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod filter;
pub mod hashmap;
pub mod layered;
pub mod pool;
pub mod slot;
pub mod ssd;
pub mod tier;
pub mod variable;

pub use cache::CachePolicy;
pub use checkpoint::{CheckpointBundle, ShardEntries, Tensor, TensorData, SAVED_PARTITION_NUM};
pub use config::{
    CacheStrategy, CounterType, EmbeddingConfig, IoScheme, LayoutKind, StorageType,
};
pub use error::{Error, Result};
pub use filter::{AdmissionPolicy, CountingBloomFilter, FrequencyThreshold};
pub use hashmap::{LockFreeMap, EMPTY_KEY, TOMBSTONE_KEY};
pub use layered::{CacheStats, LayeredStorage, LookupOutcome};
pub use pool::{ByteAllocator, HeapAllocator, MemoryPool};
pub use slot::{CopyBackHint, SlotFlags, SlotHandle, SlotLayout, TierTag, ValueSlot};
pub use ssd::{RecordMeta, SsdLog, SsdLogOptions, SsdRecord};
pub use tier::{MemTier, SsdTier};
pub use variable::{EmbeddingVariable, Lookup, Snapshot, SnapshotEntry, ValueRef};
