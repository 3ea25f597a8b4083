//! Circuit-breaker rule model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::TriggeredRule;
use crate::error::FloodgateError;
use crate::util::float64_equals;

/// What signal trips the breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerStrategy {
    /// Ratio of calls slower than `max_allowed_rt_ms`.
    #[default]
    SlowRequestRatio,
    /// Ratio of calls completing with an error.
    ErrorRatio,
    /// Absolute count of calls completing with an error.
    ErrorCount,
}

/// Circuit breaking rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub resource: String,
    pub strategy: BreakerStrategy,
    /// Recovery timeout before an open breaker probes again.
    pub retry_timeout_ms: u32,
    /// Minimum completions inside the window before the breaker may trip.
    pub min_request_amount: u64,
    pub stat_interval_ms: u32,
    pub stat_sliding_window_bucket_count: u32,
    /// SlowRequestRatio only: calls above this RT count as slow.
    pub max_allowed_rt_ms: u64,
    /// Ratio threshold for the ratio strategies, raw count for ErrorCount.
    pub threshold: f64,
    /// Successful probes required to close from half-open.
    pub probe_num: u64,
}

impl Default for CircuitBreakerRule {
    fn default() -> Self {
        Self {
            id: String::new(),
            resource: String::new(),
            strategy: BreakerStrategy::SlowRequestRatio,
            retry_timeout_ms: 0,
            min_request_amount: 0,
            stat_interval_ms: 0,
            stat_sliding_window_bucket_count: 0,
            max_allowed_rt_ms: 0,
            threshold: 0.0,
            probe_num: 0,
        }
    }
}

impl PartialEq for CircuitBreakerRule {
    fn eq(&self, other: &Self) -> bool {
        let base = self.resource == other.resource
            && self.strategy == other.strategy
            && self.retry_timeout_ms == other.retry_timeout_ms
            && self.min_request_amount == other.min_request_amount
            && self.stat_interval_ms == other.stat_interval_ms
            && self.stat_sliding_window_bucket_count == other.stat_sliding_window_bucket_count;
        if !base {
            return false;
        }
        match self.strategy {
            BreakerStrategy::SlowRequestRatio => {
                self.max_allowed_rt_ms == other.max_allowed_rt_ms
                    && float64_equals(self.threshold, other.threshold)
            }
            BreakerStrategy::ErrorRatio | BreakerStrategy::ErrorCount => {
                float64_equals(self.threshold, other.threshold)
            }
        }
    }
}

impl CircuitBreakerRule {
    pub fn is_valid(&self) -> Result<(), FloodgateError> {
        if self.resource.is_empty() {
            return Err(FloodgateError::invalid_rule("empty resource in circuit-breaker rule"));
        }
        if self.stat_interval_ms == 0 {
            return Err(FloodgateError::invalid_rule("zero stat interval in circuit-breaker rule"));
        }
        if self.retry_timeout_ms == 0 {
            return Err(FloodgateError::invalid_rule("zero retry timeout in circuit-breaker rule"));
        }
        if self.threshold < 0.0 {
            return Err(FloodgateError::invalid_rule("negative threshold in circuit-breaker rule"));
        }
        if matches!(self.strategy, BreakerStrategy::SlowRequestRatio | BreakerStrategy::ErrorRatio)
            && self.threshold > 1.0
        {
            return Err(FloodgateError::invalid_rule("ratio threshold must not exceed 1.0"));
        }
        Ok(())
    }

    /// Whether a breaker built for `self` can keep its window when
    /// replaced by `new_rule`.
    pub fn is_stat_reusable(&self, new_rule: &CircuitBreakerRule) -> bool {
        self.resource == new_rule.resource
            && self.strategy == new_rule.strategy
            && self.stat_interval_ms == new_rule.stat_interval_ms
            && self.stat_sliding_window_bucket_count == new_rule.stat_sliding_window_bucket_count
    }

    /// Bucket count of the breaker's private window; falls back to one
    /// bucket when the configured count does not divide the interval.
    pub(crate) fn stat_bucket_count(&self) -> u32 {
        let count = self.stat_sliding_window_bucket_count;
        if count == 0 || self.stat_interval_ms % count != 0 {
            1
        } else {
            count
        }
    }
}

impl fmt::Display for CircuitBreakerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => write!(
                f,
                "CircuitBreakerRule{{resource={}, strategy={:?}, threshold={}}}",
                self.resource, self.strategy, self.threshold
            ),
        }
    }
}

impl TriggeredRule for CircuitBreakerRule {
    fn resource_name(&self) -> &str {
        &self.resource
    }
}
