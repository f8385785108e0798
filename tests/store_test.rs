//! End-to-end scenarios across the tier stack, the SSD log, and the
//! checkpoint path.

use std::sync::Arc;

use tierkv::ssd::{SsdLog, SsdLogOptions, SsdRecord};
use tierkv::{
    CacheStrategy, EmbeddingConfig, EmbeddingVariable, IoScheme, Lookup, StorageType, TensorData,
};

fn admitted(lookup: Lookup) -> tierkv::ValueRef {
    lookup.admitted().expect("id should be admitted")
}

fn log_options(total_dims: usize, segment_bytes: u64, async_compaction: bool) -> SsdLogOptions {
    SsdLogOptions {
        total_dims,
        segment_bytes,
        compaction_threshold: 0.5,
        max_sealed_segments: 8,
        async_compaction,
        io_scheme: IoScheme::Mmap,
    }
}

fn flush_values(log: &SsdLog, ids: impl Iterator<Item = i64>, value_of: impl Fn(i64) -> f32) {
    let mut keys = Vec::new();
    let mut payloads = Vec::new();
    for id in ids {
        keys.push(id);
        payloads.push([value_of(id)]);
        if keys.len() == 4096 {
            let records: Vec<SsdRecord<'_>> = keys
                .iter()
                .zip(&payloads)
                .map(|(&key, payload)| SsdRecord {
                    key,
                    flags: 0,
                    version: 0,
                    frequency: 1,
                    payload,
                })
                .collect();
            log.flush_batch(&records).unwrap();
            keys.clear();
            payloads.clear();
        }
    }
    if !keys.is_empty() {
        let records: Vec<SsdRecord<'_>> = keys
            .iter()
            .zip(&payloads)
            .map(|(&key, payload)| SsdRecord {
                key,
                flags: 0,
                version: 0,
                frequency: 1,
                payload,
            })
            .collect();
        log.flush_batch(&records).unwrap();
    }
}

// Commit 262_144 ids with value i+3, re-commit ids 0..=131_072 with
// value i+1, let compaction run, then read everything back.
#[test]
fn ssd_round_trip_across_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = log_options(1, 1 << 20, false);
    // The re-commit leaves the early segments almost exactly half dead;
    // a 0.6 threshold makes every one of them eligible.
    options.compaction_threshold = 0.6;
    let log = SsdLog::open(dir.path(), options).unwrap();
    let n: i64 = 262_144;

    flush_values(&log, 0..n, |i| (i + 3) as f32);
    flush_values(&log, 0..=131_072, |i| (i + 1) as f32);

    let mut out = [0f32; 1];
    for id in 0..n {
        log.get(id, &mut out).unwrap().unwrap();
        let expected = if id <= 131_072 { (id + 1) as f32 } else { (id + 3) as f32 };
        assert_eq!(out[0], expected, "id {id}");
    }
}

// Kill the process (no graceful shutdown beyond a final fsync), damage
// the trailing record, and expect the rebuilt manifest to hold exactly
// the fsynced-and-intact ids.
#[test]
fn restart_manifest_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let n: i64 = 2_000;
    {
        let log = SsdLog::open(dir.path(), log_options(1, 1 << 16, false)).unwrap();
        flush_values(&log, 0..n, |i| i as f32);
        std::mem::forget(log); // crash: no close, no Drop
    }

    // Corrupt the tail of the newest non-empty segment.
    let mut segs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "seg"))
        .collect();
    segs.sort();
    let victim = segs
        .iter()
        .rev()
        .find(|p| std::fs::metadata(p).unwrap().len() > 16)
        .unwrap();
    let mut bytes = std::fs::read(victim).unwrap();
    let len = bytes.len();
    bytes[len - 3..].fill(0x99);
    std::fs::write(victim, &bytes).unwrap();

    let log = SsdLog::open(dir.path(), log_options(1, 1 << 16, false)).unwrap();
    let stats = log.recovery_stats();
    assert_eq!(stats.recovered_ids as i64, n - 1);
    assert_eq!(stats.truncated_segments, 1);
    let mut out = [0f32; 1];
    for id in 0..n - 1 {
        log.get(id, &mut out).unwrap().unwrap();
        assert_eq!(out[0], id as f32);
    }
    assert!(log.get(n - 1, &mut out).unwrap().is_none());
}

// Dump → fresh store → import → dump must be a fixed point, including
// the filtered (shadow) group.
#[test]
fn checkpoint_round_trip_is_fixed_point() {
    let mut cfg = EmbeddingConfig::new(3).with_filter_freq(3);
    cfg.use_counter_filter = true;
    let v1 = EmbeddingVariable::new("emb/table", cfg.clone()).unwrap();

    // Ids 0..50 admitted (three observations each), 100..110 shadows.
    for i in 0..50i64 {
        for _ in 0..3 {
            v1.lookup_or_create(i, Some(&[i as f32, 0.5, -1.0])).unwrap();
        }
        let r = admitted(v1.lookup_or_create(i, Some(&[0.0; 3])).unwrap());
        v1.update_version(r.handle(), 10 + i).unwrap();
    }
    for i in 100..110i64 {
        assert!(v1
            .lookup_or_create(i, Some(&[0.0; 3]))
            .unwrap()
            .admitted()
            .is_none());
    }
    assert_eq!(v1.size(), 50);

    let dump1 = v1.export(0).unwrap();
    let v2 = EmbeddingVariable::new("emb/table", cfg).unwrap();
    v2.import(&dump1, 0, 1).unwrap();
    assert_eq!(v2.size(), 50);
    let dump2 = v2.export(0).unwrap();

    assert_eq!(dump1.tensors().len(), dump2.tensors().len());
    for (a, b) in dump1.tensors().iter().zip(dump2.tensors()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.shape, b.shape, "shape mismatch in {}", a.name);
        assert_eq!(a.data, b.data, "data mismatch in {}", a.name);
    }

    // Restored values and versions are exact.
    let r = admitted(v2.lookup_or_create(7, Some(&[0.0; 3])).unwrap());
    assert_eq!(unsafe { r.primary() }, &[7.0, 0.5, -1.0]);
    assert_eq!(r.version(), 17);
}

#[test]
fn checkpoint_tensor_names_are_alphabetical() {
    let v = EmbeddingVariable::new("emb/table", EmbeddingConfig::new(2)).unwrap();
    for i in 0..10i64 {
        v.lookup_or_create(i, Some(&[1.0, 2.0])).unwrap();
    }
    let bundle = v.export(3).unwrap();
    let names: Vec<&str> = bundle.tensors().iter().map(|t| t.name.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
    assert_eq!(names.len(), 9);
    assert!(names.iter().all(|n| n.starts_with("emb/table/part_3-")));
}

#[test]
fn import_honors_partition_sharding() {
    let cfg = EmbeddingConfig::new(2);
    let v1 = EmbeddingVariable::new("emb", cfg.clone()).unwrap();
    for i in 0..40i64 {
        v1.lookup_or_create(i, Some(&[i as f32, 0.0])).unwrap();
    }
    let dump = v1.export(0).unwrap();

    // Restore the part_0 dump as shard 0 of 4: only ids with
    // id % 4 == 0 stay.
    let shard = EmbeddingVariable::new("emb", cfg).unwrap();
    shard.import(&dump, 0, 4).unwrap();
    assert_eq!(shard.size(), 10);
    assert!(shard.contains(0));
    assert!(shard.contains(36));
    assert!(!shard.contains(1));
}

// The offsets tensor partitions the keys by their sub-partition buckets.
#[test]
fn partition_offsets_index_the_keys() {
    let v = EmbeddingVariable::new("v", EmbeddingConfig::new(2)).unwrap();
    for i in [5i64, 1005, 2005, 7, 2007] {
        v.lookup_or_create(i, Some(&[0.0, 0.0])).unwrap();
    }
    let bundle = v.export(0).unwrap();
    let keys = match &bundle.tensor("v/part_0-keys").unwrap().data {
        TensorData::I64(k) => k.clone(),
        _ => panic!("keys dtype"),
    };
    let offsets = match &bundle.tensor("v/part_0-partition_offset").unwrap().data {
        TensorData::I32(o) => o.clone(),
        _ => panic!("offset dtype"),
    };
    // Bucket 5 holds {5, 1005, 2005}, bucket 7 holds {7, 2007}.
    assert_eq!(keys, vec![5, 1005, 2005, 7, 2007]);
    assert_eq!(offsets[5], 0);
    assert_eq!(offsets[6], 3);
    assert_eq!(offsets[7], 3);
    assert_eq!(offsets[8], 5);
}

// Many writers hammering overlapping ids: every id ends with exactly one
// slot whose header reflects the highest step written.
#[test]
fn concurrent_lookups_and_updates_converge() {
    let cfg = EmbeddingConfig::new(4).with_cache_strategy(CacheStrategy::Lfu);
    let v = Arc::new(EmbeddingVariable::new("emb", cfg).unwrap());
    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let v = Arc::clone(&v);
            std::thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(t);
                for step in 0..2_000i64 {
                    let id = rng.i64(0..256);
                    let r = admitted(v.lookup_or_create(id, Some(&[0.25; 4])).unwrap());
                    v.update_version(r.handle(), step).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(v.size(), 256);
    let snapshot = v.snapshot().unwrap();
    assert_eq!(snapshot.keys.len(), 256);
    for (i, &key) in snapshot.keys.iter().enumerate() {
        assert!((0..256).contains(&key));
        // Every slot got the default exactly once and a version from
        // some completed update.
        assert_eq!(snapshot.values[i * 4], 0.25);
        assert!(snapshot.versions[i] < 2_000);
    }
}

// A DRAM+SSD stack under load: evicted ids keep serving their bytes.
#[test]
fn tiered_store_survives_eviction_pressure() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = EmbeddingConfig::new(4)
        .with_storage(StorageType::DramSsd)
        .with_ssd_dir(dir.path());
    cfg.size[0] = 16 * 64; // 64 slots in memory
    cfg.eviction_batch_size = 32;
    cfg.async_compaction = false;
    let v = EmbeddingVariable::new("emb", cfg).unwrap();

    for i in 0..1_000i64 {
        let r = admitted(v.lookup_or_create(i, Some(&[i as f32; 4])).unwrap());
        v.update_version(r.handle(), i).unwrap();
    }
    v.run_eviction_pass();
    assert_eq!(v.size(), 1_000);

    for i in (0..1_000).step_by(13) {
        let r = admitted(v.lookup_or_create(i, Some(&[-1.0; 4])).unwrap());
        // The stored value, not the default, comes back after promotion.
        assert_eq!(unsafe { r.primary() }[0], i as f32, "id {i}");
        assert_eq!(r.version(), i);
    }
    v.close().unwrap();
}

// Close spills memory to SSD; a new store over the same directory serves
// the same data.
#[test]
fn reopen_after_close_restores_from_ssd() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = EmbeddingConfig::new(2)
        .with_storage(StorageType::DramSsd)
        .with_ssd_dir(dir.path());
    cfg.async_compaction = false;
    {
        let v = EmbeddingVariable::new("emb", cfg.clone()).unwrap();
        for i in 0..100i64 {
            let r = admitted(v.lookup_or_create(i, Some(&[i as f32, 7.0])).unwrap());
            v.update_version(r.handle(), 42).unwrap();
        }
        v.close().unwrap();
    }
    let v = EmbeddingVariable::new("emb", cfg).unwrap();
    assert_eq!(v.size(), 100);
    let r = admitted(v.lookup_or_create(63, Some(&[0.0, 0.0])).unwrap());
    assert_eq!(unsafe { r.primary() }, &[63.0, 7.0]);
    assert_eq!(r.version(), 42);
    v.close().unwrap();
}
