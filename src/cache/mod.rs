//! Eviction ranking over feature ids.
//!
//! One policy instance tracks one in-memory tier. A single mutex guards
//! the inner state; callers batch their updates (lookup returns, eviction
//! sweeps), so contention stays low. The concrete enum keeps dispatch
//! devirtualized.
//!
//! Prefetch staging: `add_to_prefetch_list` seeds ids as "recently
//! touched" so they rank hotter than anything stale, but they do not
//! count toward `size()` until `add_to_cache` commits them (or a real
//! `touch` lands on them).

pub mod lfu;
pub mod lru;

use parking_lot::Mutex;

use crate::config::CacheStrategy;
use lfu::LfuPolicy;
use lru::LruPolicy;

pub(crate) trait PolicyOps {
    fn touch(&mut self, id: i64, count: i64);
    fn add_to_prefetch_list(&mut self, ids: &[i64]);
    fn add_to_cache(&mut self, ids: &[i64]);
    fn get_evict_ids(&mut self, out: &mut Vec<i64>, k: usize) -> usize;
    fn get_cached_ids(
        &self,
        out: &mut Vec<i64>,
        max: usize,
        touch_ticks: Option<&mut Vec<u64>>,
        freqs: Option<&mut Vec<i64>>,
    ) -> usize;
    fn remove(&mut self, id: i64);
    fn size(&self) -> usize;
    fn clear(&mut self);
}

enum PolicyImpl {
    Lru(LruPolicy),
    Lfu(LfuPolicy),
}

impl PolicyImpl {
    fn ops(&mut self) -> &mut dyn PolicyOps {
        match self {
            PolicyImpl::Lru(p) => p,
            PolicyImpl::Lfu(p) => p,
        }
    }

    fn ops_ref(&self) -> &dyn PolicyOps {
        match self {
            PolicyImpl::Lru(p) => p,
            PolicyImpl::Lfu(p) => p,
        }
    }
}

pub struct CachePolicy {
    inner: Mutex<PolicyImpl>,
}

impl CachePolicy {
    pub fn new(strategy: CacheStrategy) -> CachePolicy {
        let inner = match strategy {
            CacheStrategy::Lru => PolicyImpl::Lru(LruPolicy::new()),
            CacheStrategy::Lfu => PolicyImpl::Lfu(LfuPolicy::new()),
        };
        CachePolicy {
            inner: Mutex::new(inner),
        }
    }

    /// Records `count` accesses; inserts the id as a cache member if
    /// absent and promotes it in the ranking. `count` below 1 counts as 1.
    pub fn touch(&self, id: i64, count: i64) {
        self.inner.lock().ops().touch(id, count.max(1));
    }

    /// Seeds ids expected to be hot soon. Ranked as recently touched,
    /// excluded from `size()` until committed.
    pub fn add_to_prefetch_list(&self, ids: &[i64]) {
        self.inner.lock().ops().add_to_prefetch_list(ids);
    }

    /// Commits prefetch-tagged ids into membership.
    pub fn add_to_cache(&self, ids: &[i64]) {
        self.inner.lock().ops().add_to_cache(ids);
    }

    /// Pops up to `k` victims, coldest first, removing them from the
    /// cache. Returns how many were produced.
    pub fn get_evict_ids(&self, out: &mut Vec<i64>, k: usize) -> usize {
        self.inner.lock().ops().get_evict_ids(out, k)
    }

    /// Enumerates current members for checkpoint restore. `touch_ticks`
    /// receives each member's last-touch tick, `freqs` its accumulated
    /// count.
    pub fn get_cached_ids(
        &self,
        out: &mut Vec<i64>,
        max: usize,
        touch_ticks: Option<&mut Vec<u64>>,
        freqs: Option<&mut Vec<i64>>,
    ) -> usize {
        self.inner
            .lock()
            .ops_ref()
            .get_cached_ids(out, max, touch_ticks, freqs)
    }

    /// Drops an id (explicit removal or shrink), member or prefetch.
    pub fn remove(&self, id: i64) {
        self.inner.lock().ops().remove(id);
    }

    /// Committed members only; prefetch seeds excluded.
    pub fn size(&self) -> usize {
        self.inner.lock().ops_ref().size()
    }

    pub fn clear(&self) {
        self.inner.lock().ops().clear();
    }
}
