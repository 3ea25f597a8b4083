//! Per-bucket metric counters and the metric-carrying leap array.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use crate::clock;
use crate::config::DEFAULT_STATISTIC_MAX_RT;
use crate::error::FloodgateError;
use crate::stat::leap_array::LeapArray;
use crate::stat::{MetricEvent, WriteStat};
use crate::util::LogThrottle;

/// Counters recorded for one minimum time unit (bucket span).
///
/// All operations are atomic; `min_rt` uses store-if-less which may be
/// approximate under contention.
pub struct MetricBucket {
    counters: [AtomicI64; MetricEvent::COUNT],
    min_rt: AtomicI64,
    max_concurrency: AtomicI32,
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            min_rt: AtomicI64::new(DEFAULT_STATISTIC_MAX_RT),
            max_concurrency: AtomicI32::new(0),
        }
    }
}

impl MetricBucket {
    /// Add to the counter of `event`; RT events also track the minimum.
    pub fn add(&self, event: MetricEvent, count: i64) {
        if event == MetricEvent::Rt {
            self.add_rt(count);
        } else {
            self.add_count(event, count);
        }
    }

    fn add_count(&self, event: MetricEvent, count: i64) {
        self.counters[event.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self, event: MetricEvent) -> i64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    pub fn add_rt(&self, rt: i64) {
        self.add_count(MetricEvent::Rt, rt);
        // Might not be accurate under a race; acceptable.
        if rt < self.min_rt.load(Ordering::Relaxed) {
            self.min_rt.store(rt, Ordering::Relaxed);
        }
    }

    pub fn min_rt(&self) -> i64 {
        self.min_rt.load(Ordering::Relaxed)
    }

    pub fn update_concurrency(&self, concurrency: i32) {
        if concurrency > self.max_concurrency.load(Ordering::Relaxed) {
            self.max_concurrency.store(concurrency, Ordering::Relaxed);
        }
    }

    pub fn max_concurrency(&self) -> i32 {
        self.max_concurrency.load(Ordering::Relaxed)
    }
}

static WRITE_LOG_THROTTLE: LogThrottle = LogThrottle::new(60_000);

/// [`LeapArray`] carrying [`MetricBucket`] payloads, with write helpers
/// that fail open on transient bucket errors.
pub struct MetricLeapArray {
    data: LeapArray<MetricBucket>,
}

impl MetricLeapArray {
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self, FloodgateError> {
        Ok(Self { data: LeapArray::new(sample_count, interval_ms)? })
    }

    #[cfg(test)]
    pub(crate) fn with_time(
        sample_count: u32,
        interval_ms: u32,
        now: u64,
    ) -> Result<Self, FloodgateError> {
        Ok(Self { data: LeapArray::with_time(sample_count, interval_ms, now)? })
    }

    pub fn sample_count(&self) -> u32 {
        self.data.sample_count()
    }

    pub fn interval_ms(&self) -> u32 {
        self.data.interval_ms()
    }

    pub fn bucket_length_ms(&self) -> u32 {
        self.data.bucket_length_ms()
    }

    pub fn interval_seconds(&self) -> f64 {
        self.data.interval_seconds()
    }

    pub fn add_count(&self, event: MetricEvent, count: i64) {
        self.add_count_with_time(clock::now_millis(), event, count);
    }

    pub(crate) fn add_count_with_time(&self, now: u64, event: MetricEvent, count: i64) {
        match self.data.bucket_of_time(now) {
            Ok(bucket) => bucket.add(event, count),
            Err(e) => {
                if WRITE_LOG_THROTTLE.allow() {
                    tracing::error!(error = %e, now, "failed to fetch current metric bucket");
                }
            }
        }
    }

    pub fn update_concurrency(&self, concurrency: i32) {
        self.update_concurrency_with_time(clock::now_millis(), concurrency);
    }

    pub(crate) fn update_concurrency_with_time(&self, now: u64, concurrency: i32) {
        match self.data.bucket_of_time(now) {
            Ok(bucket) => bucket.update_concurrency(concurrency),
            Err(e) => {
                if WRITE_LOG_THROTTLE.allow() {
                    tracing::error!(error = %e, now, "failed to fetch current metric bucket");
                }
            }
        }
    }

    /// Event sum over all live buckets, refreshing the current slot first
    /// so a quiescent array still expires stale windows.
    pub fn count(&self, event: MetricEvent) -> i64 {
        self.count_with_time(clock::now_millis(), event)
    }

    pub(crate) fn count_with_time(&self, now: u64, event: MetricEvent) -> i64 {
        if let Err(e) = self.data.bucket_of_time(now) {
            if WRITE_LOG_THROTTLE.allow() {
                tracing::error!(error = %e, now, "failed to refresh current metric bucket");
            }
        }
        self.data.values(now).iter().map(|b| b.get(event)).sum()
    }

    pub fn min_rt(&self) -> i64 {
        let now = clock::now_millis();
        self.data
            .values(now)
            .iter()
            .map(|b| b.min_rt())
            .min()
            .unwrap_or(DEFAULT_STATISTIC_MAX_RT)
    }

    pub fn max_concurrency(&self) -> i32 {
        let now = clock::now_millis();
        self.data.values(now).iter().map(|b| b.max_concurrency()).max().unwrap_or(0)
    }

    pub fn values(&self, now: u64) -> Vec<Arc<MetricBucket>> {
        self.data.values(now)
    }

    pub fn values_conditional(
        &self,
        now: u64,
        predicate: impl Fn(u64) -> bool,
    ) -> Vec<(u64, Arc<MetricBucket>)> {
        self.data.values_conditional(now, predicate)
    }
}

impl WriteStat for MetricLeapArray {
    fn add_count(&self, event: MetricEvent, count: i64) {
        MetricLeapArray::add_count(self, event, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_counts_events_independently() {
        let bucket = MetricBucket::default();
        bucket.add(MetricEvent::Pass, 3);
        bucket.add(MetricEvent::Block, 1);
        assert_eq!(bucket.get(MetricEvent::Pass), 3);
        assert_eq!(bucket.get(MetricEvent::Block), 1);
        assert_eq!(bucket.get(MetricEvent::Complete), 0);
    }

    #[test]
    fn rt_tracks_sum_and_minimum() {
        let bucket = MetricBucket::default();
        assert_eq!(bucket.min_rt(), DEFAULT_STATISTIC_MAX_RT);
        bucket.add(MetricEvent::Rt, 40);
        bucket.add(MetricEvent::Rt, 10);
        bucket.add(MetricEvent::Rt, 25);
        assert_eq!(bucket.get(MetricEvent::Rt), 75);
        assert_eq!(bucket.min_rt(), 10);
    }

    #[test]
    fn concurrency_keeps_maximum() {
        let bucket = MetricBucket::default();
        bucket.update_concurrency(3);
        bucket.update_concurrency(1);
        assert_eq!(bucket.max_concurrency(), 3);
    }

    #[test]
    fn array_sums_across_buckets() {
        let arr = MetricLeapArray::with_time(2, 1000, 0).unwrap();
        arr.add_count_with_time(100, MetricEvent::Pass, 2);
        arr.add_count_with_time(600, MetricEvent::Pass, 5);
        assert_eq!(arr.count_with_time(700, MetricEvent::Pass), 7);
    }

    #[test]
    fn concurrent_adds_are_exact() {
        let arr = Arc::new(MetricLeapArray::new(2, 1000).unwrap());
        let mut handles = vec![];
        for _ in 0..8 {
            let arr = arr.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    arr.add_count(MetricEvent::Pass, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arr.count(MetricEvent::Pass), 4000);
    }
}
