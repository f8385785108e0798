//! Recency ranking: the eviction order is the order of latest touches.

use hashlink::LinkedHashMap;

use super::PolicyOps;

struct LruNode {
    freq: i64,
    last_tick: u64,
    member: bool,
}

/// Insertion-ordered map; the back is the most recently touched end.
pub struct LruPolicy {
    map: LinkedHashMap<i64, LruNode>,
    members: usize,
    tick: u64,
}

impl LruPolicy {
    pub fn new() -> LruPolicy {
        LruPolicy {
            map: LinkedHashMap::new(),
            members: 0,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl PolicyOps for LruPolicy {
    fn touch(&mut self, id: i64, count: i64) {
        let tick = self.next_tick();
        // Re-insertion moves the entry to the back (hottest) position.
        let node = match self.map.remove(&id) {
            Some(mut node) => {
                node.freq = node.freq.saturating_add(count);
                node.last_tick = tick;
                if !node.member {
                    node.member = true;
                    self.members += 1;
                }
                node
            }
            None => {
                self.members += 1;
                LruNode {
                    freq: count,
                    last_tick: tick,
                    member: true,
                }
            }
        };
        self.map.insert(id, node);
    }

    fn add_to_prefetch_list(&mut self, ids: &[i64]) {
        for &id in ids {
            let tick = self.next_tick();
            let node = match self.map.remove(&id) {
                Some(mut node) => {
                    node.last_tick = tick;
                    node
                }
                None => LruNode {
                    freq: 0,
                    last_tick: tick,
                    member: false,
                },
            };
            self.map.insert(id, node);
        }
    }

    fn add_to_cache(&mut self, ids: &[i64]) {
        for &id in ids {
            if let Some(node) = self.map.get_mut(&id) {
                if !node.member {
                    node.member = true;
                    self.members += 1;
                }
            } else {
                let tick = self.next_tick();
                self.map.insert(
                    id,
                    LruNode {
                        freq: 0,
                        last_tick: tick,
                        member: true,
                    },
                );
                self.members += 1;
            }
        }
    }

    fn get_evict_ids(&mut self, out: &mut Vec<i64>, k: usize) -> usize {
        let mut victims = Vec::new();
        for (&id, node) in self.map.iter() {
            if victims.len() == k {
                break;
            }
            if node.member {
                victims.push(id);
            }
        }
        for &id in &victims {
            self.map.remove(&id);
        }
        self.members -= victims.len();
        let n = victims.len();
        out.extend(victims);
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
        for (&id, node) in self.map.iter() {
            if n == max {
                break;
            }
            if !node.member {
                continue;
            }
            out.push(id);
            if let Some(ticks) = touch_ticks.as_deref_mut() {
                ticks.push(node.last_tick);
            }
            if let Some(freqs) = freqs.as_deref_mut() {
                freqs.push(node.freq);
            }
            n += 1;
        }
        n
    }

    fn remove(&mut self, id: i64) {
        if let Some(node) = self.map.remove(&id) {
            if node.member {
                self.members -= 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.members
    }

    fn clear(&mut self) {
        self.map.clear();
        self.members = 0;
    }
}
