//! Bounded LRU caches of per-parameter atomic counters.

use std::num::NonZeroUsize;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::context::ParamValue;

pub(crate) const CONCURRENCY_MAX_COUNT: usize = 4_000;
pub(crate) const PARAMS_CAPACITY_BASE: usize = 4_000;
pub(crate) const PARAMS_MAX_CAPACITY: usize = 20_000;

/// LRU-bounded map from parameter value to a shared atomic counter.
///
/// The lock only guards the map shape; counter updates go through the
/// returned `Arc<AtomicI64>` outside the lock. Evicted entries free their
/// counter when the last user drops it.
pub struct ParamCounterCache {
    inner: Mutex<LruCache<ParamValue, Arc<AtomicI64>>>,
}

impl ParamCounterCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    /// Fetch the counter for `key`, promoting it in the LRU order.
    pub fn get(&self, key: &ParamValue) -> Option<Arc<AtomicI64>> {
        self.inner.lock().get(key).cloned()
    }

    /// Insert a fresh counter initialised to `init` unless `key` already
    /// has one. Returns the existing counter, or `None` if this call
    /// inserted.
    pub fn add_if_absent(&self, key: ParamValue, init: i64) -> Option<Arc<AtomicI64>> {
        let mut guard = self.inner.lock();
        if let Some(existing) = guard.get(&key) {
            return Some(existing.clone());
        }
        guard.put(key, Arc::new(AtomicI64::new(init)));
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every counter.
    pub fn purge(&self) {
        self.inner.lock().clear();
    }
}

/// The counter caches of one hot-spot controller. QPS behaviours use the
/// refill-time and token caches; the concurrency metric uses its own.
#[derive(Default)]
pub struct ParamsMetric {
    pub(crate) rule_time_counter: Option<ParamCounterCache>,
    pub(crate) rule_token_counter: Option<ParamCounterCache>,
    pub(crate) concurrency_counter: Option<ParamCounterCache>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn add_if_absent_returns_prior_counter() {
        let cache = ParamCounterCache::new(4);
        assert!(cache.add_if_absent(ParamValue::from("A"), 7).is_none());
        let prior = cache.add_if_absent(ParamValue::from("A"), 99).unwrap();
        assert_eq!(prior.load(Ordering::Relaxed), 7);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = ParamCounterCache::new(2);
        cache.add_if_absent(ParamValue::from("A"), 1);
        cache.add_if_absent(ParamValue::from("B"), 2);
        // Touch A so B becomes the eviction candidate.
        cache.get(&ParamValue::from("A"));
        cache.add_if_absent(ParamValue::from("C"), 3);
        assert!(cache.get(&ParamValue::from("A")).is_some());
        assert!(cache.get(&ParamValue::from("B")).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn counters_survive_outside_the_lock() {
        let cache = ParamCounterCache::new(2);
        cache.add_if_absent(ParamValue::from("A"), 0);
        let counter = cache.get(&ParamValue::from("A")).unwrap();
        counter.fetch_add(5, Ordering::Relaxed);
        assert_eq!(cache.get(&ParamValue::from("A")).unwrap().load(Ordering::Relaxed), 5);
        cache.purge();
        assert!(cache.is_empty());
        // The held Arc stays valid after eviction.
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }
}
