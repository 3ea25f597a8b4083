//! Token-calculation strategies: constant, warm-up ramp, memory-adaptive.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock;
use crate::config::DEFAULT_WARM_UP_COLD_FACTOR;
use crate::flow::controller::TrafficShapingCalculator;
use crate::flow::rule::FlowRule;
use crate::stat::{MetricEvent, ReadStat};
use crate::system_metric;

/// Returns the configured threshold unchanged.
pub struct ConstantCalculator {
    threshold: f64,
}

impl ConstantCalculator {
    pub(crate) fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl TrafficShapingCalculator for ConstantCalculator {
    fn calculate_allowed_tokens(&self, _batch_count: u32, _flag: i32) -> f64 {
        self.threshold
    }
}

/// Cold-token reservoir producing a gradual QPS ramp.
///
/// While stored tokens stay above `warning_token` the system is considered
/// cold and the allowed rate follows the reservoir slope; once consumption
/// drains the reservoir below the warning line the full threshold applies.
pub struct WarmUpCalculator {
    threshold: f64,
    cold_factor: u32,
    warning_token: u64,
    max_token: u64,
    slope: f64,
    stored_tokens: AtomicI64,
    last_filled_time: AtomicU64,
    read_stat: Arc<dyn ReadStat>,
}

impl WarmUpCalculator {
    pub(crate) fn new(rule: &FlowRule, read_stat: Arc<dyn ReadStat>) -> Self {
        let cold_factor = if rule.warm_up_cold_factor <= 1 {
            tracing::warn!(
                resource = %rule.resource,
                default = DEFAULT_WARM_UP_COLD_FACTOR,
                "warm-up cold factor not set, using default"
            );
            DEFAULT_WARM_UP_COLD_FACTOR
        } else {
            rule.warm_up_cold_factor
        };
        let period = f64::from(rule.warm_up_period_sec);
        let warning_token = (period * rule.threshold / f64::from(cold_factor - 1)) as u64;
        let max_token =
            warning_token + (2.0 * period * rule.threshold / f64::from(1 + cold_factor)) as u64;
        let slope =
            f64::from(cold_factor - 1) / rule.threshold / (max_token - warning_token) as f64;
        Self {
            threshold: rule.threshold,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicI64::new(0),
            last_filled_time: AtomicU64::new(0),
            read_stat,
        }
    }

    fn sync_token(&self, pass_qps: f64) {
        let current_time = clock::now_millis();
        let current_time = current_time - current_time % 1000;
        let old_last_fill_time = self.last_filled_time.load(Ordering::Acquire);
        // Skip on clock rewind, and refill at most once per second.
        if current_time <= old_last_fill_time {
            return;
        }
        let old_value = self.stored_tokens.load(Ordering::Acquire);
        let new_value = self.cool_down_tokens(current_time, pass_qps);
        if self
            .stored_tokens
            .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if self.stored_tokens.fetch_sub(pass_qps as i64, Ordering::AcqRel) - (pass_qps as i64) < 0
            {
                self.stored_tokens.store(0, Ordering::Release);
            }
            self.last_filled_time.store(current_time, Ordering::Release);
        }
    }

    fn cool_down_tokens(&self, current_time: u64, pass_qps: f64) -> i64 {
        let old_value = self.stored_tokens.load(Ordering::Acquire);
        let last_filled = self.last_filled_time.load(Ordering::Acquire);
        let refill = |old: i64| -> i64 {
            old + ((current_time.saturating_sub(last_filled)) as f64 * self.threshold / 1000.0)
                as i64
        };
        let mut new_value = old_value;
        if old_value < self.warning_token as i64 {
            new_value = refill(old_value);
        } else if old_value > self.warning_token as i64 {
            // Above the warning line: keep topping up only while the
            // consumed rate says the system is still cold.
            if pass_qps < self.threshold / f64::from(self.cold_factor) {
                new_value = refill(old_value);
            }
        }
        new_value.min(self.max_token as i64)
    }
}

impl TrafficShapingCalculator for WarmUpCalculator {
    fn calculate_allowed_tokens(&self, _batch_count: u32, _flag: i32) -> f64 {
        let previous_qps = self.read_stat.previous_qps(MetricEvent::Pass);
        self.sync_token(previous_qps);
        let rest_token = self.stored_tokens.load(Ordering::Acquire).max(0);
        if rest_token >= self.warning_token as i64 {
            let above_token = rest_token - self.warning_token as i64;
            // Nudge upward so boundary comparisons stay permissive.
            (1.0 / (above_token as f64 * self.slope + 1.0 / self.threshold)).next_up()
        } else {
            self.threshold
        }
    }
}

/// Interpolates the threshold between the low- and high-memory marks.
pub struct MemoryAdaptiveCalculator {
    low_mem_usage_threshold: f64,
    high_mem_usage_threshold: f64,
    mem_low_water_mark: f64,
    mem_high_water_mark: f64,
}

impl MemoryAdaptiveCalculator {
    pub(crate) fn new(rule: &FlowRule) -> Self {
        Self {
            low_mem_usage_threshold: rule.low_mem_usage_threshold as f64,
            high_mem_usage_threshold: rule.high_mem_usage_threshold as f64,
            mem_low_water_mark: rule.mem_low_water_mark_bytes as f64,
            mem_high_water_mark: rule.mem_high_water_mark_bytes as f64,
        }
    }
}

impl TrafficShapingCalculator for MemoryAdaptiveCalculator {
    fn calculate_allowed_tokens(&self, _batch_count: u32, _flag: i32) -> f64 {
        let mem = system_metric::current_memory_usage() as f64;
        if mem <= self.mem_low_water_mark {
            self.low_mem_usage_threshold
        } else if mem >= self.mem_high_water_mark {
            self.high_mem_usage_threshold
        } else {
            (self.high_mem_usage_threshold - self.low_mem_usage_threshold)
                / (self.mem_high_water_mark - self.mem_low_water_mark)
                * (mem - self.mem_low_water_mark)
                + self.low_mem_usage_threshold
        }
    }
}
