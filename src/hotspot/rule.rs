//! Hot-spot rule model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::TriggeredRule;
use crate::context::ParamValue;
use crate::error::FloodgateError;

/// Metric the per-parameter check tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// In-flight calls per parameter value.
    #[default]
    Concurrency,
    /// Token-bucket rate per parameter value.
    Qps,
}

/// What to do when a parameter exceeds its share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlBehavior {
    #[default]
    Reject,
    Throttling,
}

/// Threshold override for one specific parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificItem {
    pub param: ParamValue,
    pub threshold: i64,
}

/// Partitions a limit across the values of one call argument.
///
/// The argument is selected by `param_key` (looked up in attachments, with
/// priority) or by `param_index` — non-negative from the front of the
/// argument list, negative from the back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HotspotRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub resource: String,
    pub metric_type: MetricType,
    pub control_behavior: ControlBehavior,
    pub param_index: i32,
    pub param_key: String,
    pub threshold: i64,
    /// Throttling + QPS only.
    pub max_queueing_time_ms: i64,
    /// Extra tokens tolerated above the steady rate; Reject + QPS only.
    pub burst_count: i64,
    /// Statistic span in seconds; QPS only.
    pub duration_in_sec: i64,
    pub params_max_capacity: i64,
    pub specific_items: Vec<SpecificItem>,
}

impl PartialEq for HotspotRule {
    fn eq(&self, other: &Self) -> bool {
        let base = self.resource == other.resource
            && self.metric_type == other.metric_type
            && self.control_behavior == other.control_behavior
            && self.params_max_capacity == other.params_max_capacity
            && self.param_index == other.param_index
            && self.param_key == other.param_key
            && self.threshold == other.threshold
            && self.duration_in_sec == other.duration_in_sec
            && self.specific_items == other.specific_items;
        if !base {
            return false;
        }
        match self.control_behavior {
            ControlBehavior::Reject => self.burst_count == other.burst_count,
            ControlBehavior::Throttling => self.max_queueing_time_ms == other.max_queueing_time_ms,
        }
    }
}

impl HotspotRule {
    pub fn is_valid(&self) -> Result<(), FloodgateError> {
        if self.resource.is_empty() {
            return Err(FloodgateError::invalid_rule("empty resource in hotspot rule"));
        }
        if self.threshold < 0 {
            return Err(FloodgateError::invalid_rule("negative threshold in hotspot rule"));
        }
        if self.metric_type == MetricType::Qps && self.duration_in_sec <= 0 {
            return Err(FloodgateError::invalid_rule(
                "duration_in_sec must be positive for QPS hotspot rules",
            ));
        }
        Ok(())
    }

    /// Whether counters built for `self` can back a controller for
    /// `new_rule`.
    pub fn is_stat_reusable(&self, new_rule: &HotspotRule) -> bool {
        self.resource == new_rule.resource
            && self.control_behavior == new_rule.control_behavior
            && self.params_max_capacity == new_rule.params_max_capacity
            && self.duration_in_sec == new_rule.duration_in_sec
            && self.metric_type == new_rule.metric_type
    }
}

impl fmt::Display for HotspotRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => {
                write!(f, "HotspotRule{{resource={}, threshold={}}}", self.resource, self.threshold)
            }
        }
    }
}

impl TriggeredRule for HotspotRule {
    fn resource_name(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qps_rule() -> HotspotRule {
        HotspotRule {
            resource: "hs".into(),
            metric_type: MetricType::Qps,
            threshold: 5,
            duration_in_sec: 1,
            ..Default::default()
        }
    }

    #[test]
    fn qps_rules_need_a_duration() {
        assert!(qps_rule().is_valid().is_ok());
        let mut bad = qps_rule();
        bad.duration_in_sec = 0;
        assert!(bad.is_valid().is_err());
    }

    #[test]
    fn equality_ignores_the_inactive_behavior_field() {
        let a = qps_rule();
        let mut b = qps_rule();
        b.max_queueing_time_ms = 999; // Reject behavior ignores it
        assert_eq!(a, b);
        b.burst_count = 3;
        assert_ne!(a, b);
    }

    #[test]
    fn stat_reuse_ignores_thresholds() {
        let a = qps_rule();
        let mut b = qps_rule();
        b.threshold = 50;
        assert!(a.is_stat_reusable(&b));
        b.duration_in_sec = 2;
        assert!(!a.is_stat_reusable(&b));
    }
}
