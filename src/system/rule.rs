//! System rule model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::TriggeredRule;
use crate::error::FloodgateError;
use crate::util::float64_equals;

/// Which system-wide signal the rule watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemMetricType {
    /// System load1.
    #[default]
    Load,
    /// Average RT of all inbound requests.
    AvgRt,
    /// Concurrency of all inbound requests.
    Concurrency,
    /// QPS of all inbound requests.
    InboundQps,
    /// Process CPU usage ratio.
    CpuUsage,
}

/// What happens once the trigger fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdaptiveStrategy {
    /// Block outright while the metric exceeds the trigger.
    #[default]
    NoAdaptive,
    /// Admit only while in-flight work stays within the estimated
    /// bandwidth-delay product.
    Bbr,
}

/// Global (resource-independent) adaptive protection rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub metric_type: SystemMetricType,
    /// The adaptive strategy stays dormant until the metric reaches this.
    pub trigger_count: f64,
    pub strategy: AdaptiveStrategy,
}

impl PartialEq for SystemRule {
    fn eq(&self, other: &Self) -> bool {
        self.metric_type == other.metric_type
            && float64_equals(self.trigger_count, other.trigger_count)
            && self.strategy == other.strategy
    }
}

impl SystemRule {
    pub fn is_valid(&self) -> Result<(), FloodgateError> {
        if self.trigger_count < 0.0 {
            return Err(FloodgateError::invalid_rule("negative trigger count in system rule"));
        }
        Ok(())
    }
}

impl fmt::Display for SystemRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => write!(
                f,
                "SystemRule{{metricType={:?}, triggerCount={}}}",
                self.metric_type, self.trigger_count
            ),
        }
    }
}

impl TriggeredRule for SystemRule {
    fn resource_name(&self) -> &str {
        match self.metric_type {
            SystemMetricType::Load => "load",
            SystemMetricType::AvgRt => "avgRT",
            SystemMetricType::Concurrency => "concurrency",
            SystemMetricType::InboundQps => "inboundQPS",
            SystemMetricType::CpuUsage => "cpuUsage",
        }
    }
}
