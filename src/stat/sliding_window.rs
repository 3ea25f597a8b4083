//! Read-only derived windows over a metric leap array.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock;
use crate::config::DEFAULT_STATISTIC_MAX_RT;
use crate::error::FloodgateError;
use crate::metrics::MetricItem;
use crate::stat::leap_array::calculate_start_time;
use crate::stat::metric_bucket::{MetricBucket, MetricLeapArray};
use crate::stat::{check_validity_for_reuse_statistic, MetricEvent, ReadStat};

/// Read-only sliding-window view over a shared [`MetricLeapArray`].
///
/// Stores no data of its own: aggregates are computed on demand from the
/// parent's buckets, restricted to this window's span and resolution. The
/// window shape must satisfy the reuse constraint against the parent or
/// construction fails.
pub struct SlidingWindowMetric {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    real: Arc<MetricLeapArray>,
}

impl std::fmt::Debug for SlidingWindowMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowMetric")
            .field("bucket_length_ms", &self.bucket_length_ms)
            .field("sample_count", &self.sample_count)
            .field("interval_ms", &self.interval_ms)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowMetric {
    pub fn new(
        sample_count: u32,
        interval_ms: u32,
        real: Arc<MetricLeapArray>,
    ) -> Result<Self, FloodgateError> {
        check_validity_for_reuse_statistic(
            sample_count,
            interval_ms,
            real.sample_count(),
            real.interval_ms(),
        )?;
        Ok(Self { bucket_length_ms: interval_ms / sample_count, sample_count, interval_ms, real })
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    fn interval_seconds(&self) -> f64 {
        f64::from(self.interval_ms) / 1000.0
    }

    /// Start-time range (inclusive) of the parent buckets this window
    /// covers at `time_ms`. The covered time span is
    /// `[start, end + parent_bucket_length)`.
    fn bucket_start_range(&self, time_ms: u64) -> (u64, u64) {
        let end = calculate_start_time(time_ms, self.real.bucket_length_ms());
        let start =
            (end + u64::from(self.real.bucket_length_ms())).saturating_sub(u64::from(self.interval_ms));
        (start, end)
    }

    fn satisfied_buckets(&self, now: u64) -> Vec<(u64, Arc<MetricBucket>)> {
        let (start, end) = self.bucket_start_range(now);
        self.real.values_conditional(now, |ws| ws >= start && ws <= end)
    }

    fn sum_with_time(&self, now: u64, event: MetricEvent) -> i64 {
        self.satisfied_buckets(now).iter().map(|(_, b)| b.get(event)).sum()
    }

    fn qps_with_time(&self, now: u64, event: MetricEvent) -> f64 {
        self.sum_with_time(now, event) as f64 / self.interval_seconds()
    }

    /// Largest single-bucket count of `event` in the window.
    pub fn max_of_single_bucket(&self, event: MetricEvent) -> i64 {
        self.satisfied_buckets(clock::now_millis())
            .iter()
            .map(|(_, b)| b.get(event))
            .max()
            .unwrap_or(0)
    }

    /// Peak per-second rate estimate: the busiest bucket scaled to one
    /// second.
    pub fn max_avg(&self, event: MetricEvent) -> f64 {
        self.max_of_single_bucket(event) as f64 * f64::from(self.sample_count)
            / self.interval_seconds()
    }

    /// Maximum concurrency observed across the window.
    pub fn max_concurrency(&self) -> i32 {
        self.satisfied_buckets(clock::now_millis())
            .iter()
            .map(|(_, b)| b.max_concurrency())
            .max()
            .unwrap_or(0)
    }

    /// Aggregate one [`MetricItem`] per second from the parent buckets
    /// whose start satisfies `predicate`.
    pub fn second_metrics_on_condition(&self, predicate: impl Fn(u64) -> bool) -> Vec<MetricItem> {
        let buckets = self.real.values_conditional(clock::now_millis(), predicate);
        let mut per_second: HashMap<u64, Vec<Arc<MetricBucket>>> = HashMap::with_capacity(8);
        for (start, bucket) in buckets {
            per_second.entry(start - start % 1000).or_default().push(bucket);
        }
        let mut items: Vec<MetricItem> = per_second
            .into_iter()
            .map(|(ts, buckets)| metric_item_from_buckets(ts, &buckets))
            .collect();
        items.sort_by_key(|item| item.timestamp_ms);
        items
    }
}

fn metric_item_from_buckets(ts: u64, buckets: &[Arc<MetricBucket>]) -> MetricItem {
    let mut item = MetricItem { timestamp_ms: ts, ..MetricItem::default() };
    let mut all_rt: i64 = 0;
    for bucket in buckets {
        item.pass_qps += bucket.get(MetricEvent::Pass).max(0) as u64;
        item.block_qps += bucket.get(MetricEvent::Block).max(0) as u64;
        item.error_qps += bucket.get(MetricEvent::Error).max(0) as u64;
        item.complete_qps += bucket.get(MetricEvent::Complete).max(0) as u64;
        let mc = bucket.max_concurrency().max(0) as u32;
        if mc > item.concurrency {
            item.concurrency = mc;
        }
        all_rt += bucket.get(MetricEvent::Rt);
    }
    if item.complete_qps > 0 {
        item.avg_rt = all_rt.max(0) as u64 / item.complete_qps;
    } else {
        item.avg_rt = all_rt.max(0) as u64;
    }
    item
}

impl ReadStat for SlidingWindowMetric {
    fn qps(&self, event: MetricEvent) -> f64 {
        self.qps_with_time(clock::now_millis(), event)
    }

    fn previous_qps(&self, event: MetricEvent) -> f64 {
        self.qps_with_time(
            clock::now_millis().saturating_sub(u64::from(self.bucket_length_ms)),
            event,
        )
    }

    fn sum(&self, event: MetricEvent) -> i64 {
        self.sum_with_time(clock::now_millis(), event)
    }

    fn min_rt(&self) -> f64 {
        let min = self
            .satisfied_buckets(clock::now_millis())
            .iter()
            .map(|(_, b)| b.min_rt())
            .min()
            .unwrap_or(DEFAULT_STATISTIC_MAX_RT);
        min.max(1) as f64
    }

    fn avg_rt(&self) -> f64 {
        let complete = self.sum(MetricEvent::Complete);
        if complete <= 0 {
            return 0.0;
        }
        self.sum(MetricEvent::Rt) as f64 / complete as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_over(sample_count: u32, interval_ms: u32) -> (Arc<MetricLeapArray>, SlidingWindowMetric) {
        let real = Arc::new(MetricLeapArray::new(20, 10_000).unwrap());
        let window = SlidingWindowMetric::new(sample_count, interval_ms, real.clone()).unwrap();
        (real, window)
    }

    #[test]
    fn incompatible_resolution_fails_construction() {
        let real = Arc::new(MetricLeapArray::new(20, 10_000).unwrap());
        // 250ms child bucket over a 500ms parent bucket.
        let err = SlidingWindowMetric::new(4, 1000, real.clone()).unwrap_err();
        assert!(err.is_stat_not_reusable());
        // 3000ms does not divide the 10000ms parent interval.
        assert!(SlidingWindowMetric::new(1, 3000, real).is_err());
    }

    #[test]
    fn sum_reflects_recent_writes_only() {
        let (real, window) = window_over(2, 1000);
        real.add_count(MetricEvent::Pass, 4);
        assert_eq!(window.sum(MetricEvent::Pass), 4);
        assert_eq!(real.count(MetricEvent::Pass), 4);
    }

    #[test]
    fn qps_scales_by_interval() {
        let (real, window) = window_over(2, 1000);
        real.add_count(MetricEvent::Pass, 10);
        let qps = window.qps(MetricEvent::Pass);
        assert!((qps - 10.0).abs() < f64::EPSILON, "qps={}", qps);
    }

    #[test]
    fn min_rt_clamps_to_one() {
        let (real, window) = window_over(2, 1000);
        real.add_count(MetricEvent::Rt, 0);
        assert!(window.min_rt() >= 1.0);
    }

    #[test]
    fn avg_rt_divides_by_completions() {
        let (real, window) = window_over(2, 1000);
        real.add_count(MetricEvent::Rt, 90);
        real.add_count(MetricEvent::Complete, 3);
        assert!((window.avg_rt() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn second_aggregation_groups_buckets() {
        let (real, window) = window_over(2, 1000);
        real.add_count(MetricEvent::Pass, 2);
        real.add_count(MetricEvent::Complete, 2);
        real.add_count(MetricEvent::Rt, 20);
        let items = window.second_metrics_on_condition(|_| true);
        assert!(!items.is_empty());
        let total_pass: u64 = items.iter().map(|i| i.pass_qps).sum();
        assert_eq!(total_pass, 2);
        for item in &items {
            assert_eq!(item.timestamp_ms % 1000, 0);
        }
    }
}
