//! Flow rule model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::TriggeredRule;
use crate::error::FloodgateError;
use crate::util::float64_equals;

/// How the live threshold is computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalculateStrategy {
    /// Use the configured threshold directly.
    #[default]
    Constant,
    /// Ramp the threshold up through a cold-token reservoir.
    WarmUp,
    /// Interpolate the threshold from current process memory usage.
    MemoryAdaptive,
}

/// What to do when observed traffic reaches the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlBehavior {
    /// Refuse immediately.
    #[default]
    Reject,
    /// Queue at a uniform pace, up to a bounded wait.
    Throttling,
}

/// Which resource's statistics drive the check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationStrategy {
    #[default]
    CurrentResource,
    /// Govern by the statistics of `ref_resource` instead.
    AssociatedResource,
}

/// Flow control rule, QPS-based.
///
/// With `stat_interval_in_ms` of 1000 the threshold is plain QPS; other
/// intervals shape traffic over that span instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub resource: String,
    pub token_calculate_strategy: CalculateStrategy,
    pub control_behavior: ControlBehavior,
    pub threshold: f64,
    pub relation_strategy: RelationStrategy,
    pub ref_resource: String,
    /// Max uniform-queueing wait; Throttling only.
    pub max_queueing_time_ms: u32,
    /// WarmUp only.
    pub warm_up_period_sec: u32,
    /// WarmUp only, defaults to 3.
    pub warm_up_cold_factor: u32,
    /// Span of the controller's standalone statistic; 0 means the default
    /// metric interval.
    pub stat_interval_in_ms: u32,
    /// MemoryAdaptive only.
    pub low_mem_usage_threshold: i64,
    pub high_mem_usage_threshold: i64,
    pub mem_low_water_mark_bytes: i64,
    pub mem_high_water_mark_bytes: i64,
}

impl Default for FlowRule {
    fn default() -> Self {
        Self {
            id: String::new(),
            resource: String::new(),
            token_calculate_strategy: CalculateStrategy::Constant,
            control_behavior: ControlBehavior::Reject,
            threshold: 0.0,
            relation_strategy: RelationStrategy::CurrentResource,
            ref_resource: String::new(),
            max_queueing_time_ms: 0,
            warm_up_period_sec: 0,
            warm_up_cold_factor: 0,
            stat_interval_in_ms: 0,
            low_mem_usage_threshold: 0,
            high_mem_usage_threshold: 0,
            mem_low_water_mark_bytes: 0,
            mem_high_water_mark_bytes: 0,
        }
    }
}

impl PartialEq for FlowRule {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource
            && self.relation_strategy == other.relation_strategy
            && self.ref_resource == other.ref_resource
            && self.stat_interval_in_ms == other.stat_interval_in_ms
            && self.token_calculate_strategy == other.token_calculate_strategy
            && self.control_behavior == other.control_behavior
            && float64_equals(self.threshold, other.threshold)
            && self.max_queueing_time_ms == other.max_queueing_time_ms
            && self.warm_up_period_sec == other.warm_up_period_sec
            && self.warm_up_cold_factor == other.warm_up_cold_factor
            && self.low_mem_usage_threshold == other.low_mem_usage_threshold
            && self.high_mem_usage_threshold == other.high_mem_usage_threshold
            && self.mem_low_water_mark_bytes == other.mem_low_water_mark_bytes
            && self.mem_high_water_mark_bytes == other.mem_high_water_mark_bytes
    }
}

impl FlowRule {
    /// Whether a controller built for `self` can keep its statistic when
    /// replaced by `new_rule`.
    pub fn is_stat_reusable(&self, new_rule: &FlowRule) -> bool {
        self.resource == new_rule.resource
            && self.relation_strategy == new_rule.relation_strategy
            && self.ref_resource == new_rule.ref_resource
            && self.stat_interval_in_ms == new_rule.stat_interval_in_ms
            && self.need_statistic()
            && new_rule.need_statistic()
    }

    /// Throttling-only rules pace on their own timestamps and carry no
    /// statistic.
    pub(crate) fn need_statistic(&self) -> bool {
        self.token_calculate_strategy == CalculateStrategy::WarmUp
            || self.control_behavior == ControlBehavior::Reject
    }

    pub fn is_valid(&self) -> Result<(), FloodgateError> {
        if self.resource.is_empty() {
            return Err(FloodgateError::invalid_rule("empty resource in flow rule"));
        }
        if self.threshold < 0.0 {
            return Err(FloodgateError::invalid_rule("negative threshold in flow rule"));
        }
        if self.relation_strategy == RelationStrategy::AssociatedResource
            && self.ref_resource.is_empty()
        {
            return Err(FloodgateError::invalid_rule(
                "ref_resource must be set for AssociatedResource strategy",
            ));
        }
        if self.token_calculate_strategy == CalculateStrategy::WarmUp {
            if self.warm_up_period_sec == 0 {
                return Err(FloodgateError::invalid_rule("warm_up_period_sec must be positive"));
            }
            if self.warm_up_cold_factor == 1 {
                return Err(FloodgateError::invalid_rule("warm_up_cold_factor must exceed 1"));
            }
        }
        if self.token_calculate_strategy == CalculateStrategy::MemoryAdaptive {
            if self.mem_low_water_mark_bytes <= 0
                || self.mem_high_water_mark_bytes <= 0
                || self.high_mem_usage_threshold <= 0
                || self.low_mem_usage_threshold <= 0
            {
                return Err(FloodgateError::invalid_rule(
                    "memory-adaptive marks and thresholds must be positive",
                ));
            }
            if self.high_mem_usage_threshold >= self.low_mem_usage_threshold {
                return Err(FloodgateError::invalid_rule(
                    "high_mem_usage_threshold must be below low_mem_usage_threshold",
                ));
            }
            if self.mem_low_water_mark_bytes >= self.mem_high_water_mark_bytes {
                return Err(FloodgateError::invalid_rule(
                    "mem_low_water_mark_bytes must be below mem_high_water_mark_bytes",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => write!(f, "FlowRule{{resource={}, threshold={}}}", self.resource, self.threshold),
        }
    }
}

impl TriggeredRule for FlowRule {
    fn resource_name(&self) -> &str {
        &self.resource
    }
}
