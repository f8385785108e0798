//! Frequency ranking with a sorted index.
//!
//! The index orders members by (accumulated count, latest-touch tick);
//! ties therefore break toward the oldest latest touch. Ticks are a
//! logical counter, unique per operation, so the ordering is total and
//! deterministic.

use std::collections::BTreeSet;

use hashbrown::HashMap;

use super::PolicyOps;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreqKey {
    freq: i64,
    tick: u64,
    id: i64,
}

struct LfuNode {
    freq: i64,
    tick: u64,
    member: bool,
}

impl LfuNode {
    fn key(&self, id: i64) -> FreqKey {
        FreqKey {
            freq: self.freq,
            tick: self.tick,
            id,
        }
    }
}

pub struct LfuPolicy {
    map: HashMap<i64, LfuNode>,
    /// Members only, coldest first.
    index: BTreeSet<FreqKey>,
    tick: u64,
}

impl LfuPolicy {
    pub fn new() -> LfuPolicy {
        LfuPolicy {
            map: HashMap::new(),
            index: BTreeSet::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl PolicyOps for LfuPolicy {
    fn touch(&mut self, id: i64, count: i64) {
        let tick = self.next_tick();
        if let Some(node) = self.map.get_mut(&id) {
            if node.member {
                let existed = self.index.remove(&node.key(id));
                debug_assert!(existed);
            }
            node.freq = node.freq.saturating_add(count);
            node.tick = tick;
            node.member = true;
            self.index.insert(node.key(id));
        } else {
            let node = LfuNode {
                freq: count,
                tick,
                member: true,
            };
            self.index.insert(node.key(id));
            self.map.insert(id, node);
        }
    }

    fn add_to_prefetch_list(&mut self, ids: &[i64]) {
        for &id in ids {
            let tick = self.next_tick();
            if let Some(node) = self.map.get_mut(&id) {
                if node.member {
                    self.index.remove(&node.key(id));
                }
                node.tick = tick;
                if node.member {
                    self.index.insert(node.key(id));
                }
            } else {
                self.map.insert(
                    id,
                    LfuNode {
                        freq: 0,
                        tick,
                        member: false,
                    },
                );
            }
        }
    }

    fn add_to_cache(&mut self, ids: &[i64]) {
        for &id in ids {
            let tick = self.next_tick();
            if let Some(node) = self.map.get_mut(&id) {
                if !node.member {
                    node.member = true;
                    self.index.insert(node.key(id));
                }
            } else {
                let node = LfuNode {
                    freq: 0,
                    tick,
                    member: true,
                };
                self.index.insert(node.key(id));
                self.map.insert(id, node);
            }
        }
    }

    fn get_evict_ids(&mut self, out: &mut Vec<i64>, k: usize) -> usize {
        let mut n = 0;
        while n < k {
            let Some(&coldest) = self.index.iter().next() else {
                break;
            };
            self.index.remove(&coldest);
            self.map.remove(&coldest.id);
            out.push(coldest.id);
            n += 1;
        }
        n
    }

    fn get_cached_ids(
        &self,
        out: &mut Vec<i64>,
        max: usize,
        mut touch_ticks: Option<&mut Vec<u64>>,
        mut freqs: Option<&mut Vec<i64>>,
    ) -> usize {
        let mut n = 0;
        for key in self.index.iter() {
            if n == max {
                break;
            }
            out.push(key.id);
            if let Some(ticks) = touch_ticks.as_deref_mut() {
                ticks.push(key.tick);
            }
            if let Some(freqs) = freqs.as_deref_mut() {
                freqs.push(key.freq);
            }
            n += 1;
        }
        n
    }

    fn remove(&mut self, id: i64) {
        if let Some(node) = self.map.remove(&id) {
            if node.member {
                self.index.remove(&node.key(id));
            }
        }
    }

    fn size(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.index.clear();
    }
}
