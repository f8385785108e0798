//! In-memory index over the segment files.
//!
//! Maps each id to the location of its most recently committed record.
//! Per-segment live-byte counters are atomic; the id map is behind a
//! readers-writer lock that writers hold only for single-entry updates,
//! so compaction publication never stalls the read path for long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub segment: u64,
    pub offset: u64,
    pub length: u32,
}

pub struct Manifest {
    map: RwLock<HashMap<i64, RecordLocation>>,
    live: RwLock<HashMap<u64, Arc<AtomicU64>>>,
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest {
            map: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the live-byte counter for a fresh segment.
    pub fn register_segment(&self, segment: u64) {
        self.live
            .write()
            .entry(segment)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
    }

    /// Drops a segment's counter, returning its final live-byte count.
    pub fn drop_segment(&self, segment: u64) -> u64 {
        self.live
            .write()
            .remove(&segment)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn counter(&self, segment: u64) -> Option<Arc<AtomicU64>> {
        self.live.read().get(&segment).cloned()
    }

    fn add_live(&self, segment: u64, bytes: u64) {
        if let Some(c) = self.counter(segment) {
            c.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn sub_live(&self, segment: u64, bytes: u64) {
        if let Some(c) = self.counter(segment) {
            c.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    pub fn live_bytes(&self, segment: u64) -> u64 {
        self.counter(segment)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Points `id` at a new record, retiring the bytes of the previous
    /// one. Returns the superseded location.
    pub fn publish(&self, id: i64, loc: RecordLocation) -> Option<RecordLocation> {
        let old = self.map.write().insert(id, loc);
        self.add_live(loc.segment, loc.length as u64);
        if let Some(old) = old {
            self.sub_live(old.segment, old.length as u64);
        }
        old
    }

    /// Compaction publication: move `id` to `loc` only if it still points
    /// into `expected_segment`. Returns false when a fresh commit won.
    pub fn publish_if_segment(
        &self,
        id: i64,
        expected_segment: u64,
        expected_offset: u64,
        loc: RecordLocation,
    ) -> bool {
        let mut map = self.map.write();
        match map.get_mut(&id) {
            Some(cur) if cur.segment == expected_segment && cur.offset == expected_offset => {
                let old = *cur;
                *cur = loc;
                drop(map);
                self.add_live(loc.segment, loc.length as u64);
                self.sub_live(old.segment, old.length as u64);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: i64) -> Option<RecordLocation> {
        self.map.read().get(&id).copied()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.map.read().contains_key(&id)
    }

    pub fn remove(&self, id: i64) -> Option<RecordLocation> {
        let old = self.map.write().remove(&id);
        if let Some(old) = old {
            self.sub_live(old.segment, old.length as u64);
        }
        old
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<i64> {
        self.map.read().keys().copied().collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(i64, RecordLocation)) {
        for (&id, &loc) in self.map.read().iter() {
            f(id, loc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(segment: u64, offset: u64, length: u32) -> RecordLocation {
        RecordLocation {
            segment,
            offset,
            length,
        }
    }

    #[test]
    fn publish_moves_live_bytes() {
        let m = Manifest::new();
        m.register_segment(0);
        m.register_segment(1);
        m.publish(5, loc(0, 16, 100));
        assert_eq!(m.live_bytes(0), 100);
        m.publish(5, loc(1, 16, 100));
        assert_eq!(m.live_bytes(0), 0);
        assert_eq!(m.live_bytes(1), 100);
        assert_eq!(m.get(5), Some(loc(1, 16, 100)));
    }

    #[test]
    fn publish_if_segment_rejects_stale_source() {
        let m = Manifest::new();
        m.register_segment(0);
        m.register_segment(2);
        m.publish(9, loc(0, 16, 64));

        // Fresh commit lands in segment 2 before compaction republishes.
        m.publish(9, loc(2, 16, 64));
        assert!(!m.publish_if_segment(9, 0, 16, loc(3, 0, 64)));
        assert_eq!(m.get(9), Some(loc(2, 16, 64)));

        assert!(m.publish_if_segment(9, 2, 16, loc(3, 0, 64)));
        assert_eq!(m.get(9), Some(loc(3, 0, 64)));
        assert_eq!(m.live_bytes(2), 0);
    }

    #[test]
    fn remove_retires_bytes() {
        let m = Manifest::new();
        m.register_segment(0);
        m.publish(1, loc(0, 16, 50));
        m.publish(2, loc(0, 66, 50));
        assert_eq!(m.live_bytes(0), 100);
        m.remove(1);
        assert_eq!(m.live_bytes(0), 50);
        assert_eq!(m.len(), 1);
    }
}
