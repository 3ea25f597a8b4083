//! Lock-free ring of time-aligned buckets ("leap array").
//!
//! The ring is generic over its bucket payload: flow statistics use
//! [`super::MetricBucket`], circuit breakers plug in their own counters.
//! Counter updates go through atomics inside the payload; the only lock is
//! a try-lock serialising bucket recycling when a slot wraps to a new time
//! window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::clock;
use crate::error::FloodgateError;
use crate::stat::check_validity_for_statistic;

/// Start timestamp of the bucket covering `now`.
pub(crate) fn calculate_start_time(now: u64, bucket_length_ms: u32) -> u64 {
    now - now % u64::from(bucket_length_ms)
}

struct BucketWrap<B> {
    start: AtomicU64,
    value: ArcSwap<B>,
}

/// Pre-allocated circular array of `sample_count` buckets spanning
/// `interval_ms` milliseconds.
///
/// For example, with `sample_count = 5` and `interval_ms = 1000` each
/// bucket covers 200 ms. At time 1188 the current bucket spans
/// `[1000, 1200)`:
///
/// ```text
///   B0       B1      B2      B3      B4
///   |_______|_______|_______|_______|_______|
///  1000    1200    400     600     800    (1000) ms
///         ^
///      time=1188
/// ```
pub struct LeapArray<B> {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    buckets: Box<[BucketWrap<B>]>,
    update_lock: Mutex<()>,
}

impl<B: Default + Send + Sync + 'static> LeapArray<B> {
    /// Create an array with all bucket start times aligned around the
    /// current time.
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self, FloodgateError> {
        Self::with_time(sample_count, interval_ms, clock::now_millis())
    }

    /// Create an array aligned around an explicit timestamp.
    pub fn with_time(sample_count: u32, interval_ms: u32, now: u64) -> Result<Self, FloodgateError> {
        check_validity_for_statistic(sample_count, interval_ms)?;
        let bucket_length_ms = interval_ms / sample_count;
        let len = sample_count as usize;

        let idx = (now / u64::from(bucket_length_ms)) as usize % len;
        let mut start = calculate_start_time(now, bucket_length_ms);
        let mut buckets = Vec::with_capacity(len);
        buckets.resize_with(len, || BucketWrap {
            start: AtomicU64::new(0),
            value: ArcSwap::from_pointee(B::default()),
        });
        for i in idx..len {
            buckets[i].start.store(start, Ordering::Relaxed);
            start += u64::from(bucket_length_ms);
        }
        for bucket in buckets.iter().take(idx) {
            bucket.start.store(start, Ordering::Relaxed);
            start += u64::from(bucket_length_ms);
        }

        Ok(Self {
            bucket_length_ms,
            sample_count,
            interval_ms,
            buckets: buckets.into_boxed_slice(),
            update_lock: Mutex::new(()),
        })
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn bucket_length_ms(&self) -> u32 {
        self.bucket_length_ms
    }

    pub fn interval_seconds(&self) -> f64 {
        f64::from(self.interval_ms) / 1000.0
    }

    /// The bucket covering the current time, recycling the slot if it has
    /// wrapped into a new window.
    pub fn current_bucket(&self) -> Result<Arc<B>, FloodgateError> {
        self.bucket_of_time(clock::now_millis())
    }

    /// The bucket covering `now`.
    ///
    /// If the slot holds an older window, exactly one caller resets it
    /// under the update lock while others yield and retry. A slot holding
    /// a *newer* window than `now` means the clock went backwards; that
    /// fails loudly (except for single-bucket arrays, where contention can
    /// legitimately produce it).
    pub fn bucket_of_time(&self, now: u64) -> Result<Arc<B>, FloodgateError> {
        let idx = self.time_idx(now);
        let target_start = calculate_start_time(now, self.bucket_length_ms);
        let wrap = &self.buckets[idx];
        loop {
            let old_start = wrap.start.load(Ordering::Acquire);
            if target_start == old_start {
                return Ok(wrap.value.load_full());
            } else if target_start > old_start {
                if let Some(_guard) = self.update_lock.try_lock() {
                    // Re-check under the lock: another writer may have
                    // completed the recycle while we raced for it.
                    if wrap.start.load(Ordering::Acquire) != target_start {
                        wrap.value.store(Arc::new(B::default()));
                        wrap.start.store(target_start, Ordering::Release);
                    }
                    return Ok(wrap.value.load_full());
                }
                std::thread::yield_now();
            } else {
                if self.sample_count == 1 {
                    // Single-bucket arrays can observe this under
                    // contention right at a window boundary.
                    return Ok(wrap.value.load_full());
                }
                return Err(FloodgateError::TimeRewind { target_start, bucket_start: old_start });
            }
        }
    }

    /// All non-expired buckets as seen at `now`.
    pub fn values(&self, now: u64) -> Vec<Arc<B>> {
        self.values_conditional(now, |_| true).into_iter().map(|(_, b)| b).collect()
    }

    /// All non-expired buckets whose start time satisfies `predicate`,
    /// paired with that start time.
    pub fn values_conditional(
        &self,
        now: u64,
        predicate: impl Fn(u64) -> bool,
    ) -> Vec<(u64, Arc<B>)> {
        let mut out = Vec::with_capacity(self.buckets.len());
        for wrap in self.buckets.iter() {
            let start = wrap.start.load(Ordering::Acquire);
            if self.is_deprecated(now, start) || !predicate(start) {
                continue;
            }
            out.push((start, wrap.value.load_full()));
        }
        out
    }

    fn time_idx(&self, now: u64) -> usize {
        (now / u64::from(self.bucket_length_ms)) as usize % self.buckets.len()
    }

    fn is_deprecated(&self, now: u64, bucket_start: u64) -> bool {
        now.saturating_sub(bucket_start) > u64::from(self.interval_ms)
    }
}
