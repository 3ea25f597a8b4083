//! Adaptive system rule-check slot. Inbound traffic only.

use async_trait::async_trait;

use crate::block::{BlockError, BlockType};
use crate::chain::{Decision, RuleCheckSlot};
use crate::context::EntryContext;
use crate::resource::TrafficType;
use crate::stat::node::inbound_node;
use crate::stat::{MetricEvent, ReadStat};
use crate::system::manager::get_active_rules;
use crate::system::rule::{AdaptiveStrategy, SystemMetricType, SystemRule};
use crate::system_metric;

pub(crate) const RULE_CHECK_SLOT_ORDER: u32 = 1000;

const BLOCK_MSG: &str = "system check blocked";

/// Gates inbound traffic on process-wide signals. Below the trigger the
/// rule is dormant; above it, `NoAdaptive` refuses outright while `Bbr`
/// admits only as much in-flight work as the observed peak QPS times the
/// minimum RT supports.
pub struct AdaptiveSystemSlot;

impl AdaptiveSystemSlot {
    /// Returns the blocking snapshot value if the rule refuses the call.
    fn check_rule(rule: &SystemRule) -> Option<f64> {
        let node = inbound_node();
        let value = match rule.metric_type {
            SystemMetricType::Load => system_metric::current_load(),
            SystemMetricType::AvgRt => node.avg_rt(),
            SystemMetricType::Concurrency => f64::from(node.current_concurrency()),
            SystemMetricType::InboundQps => node.qps(MetricEvent::Pass),
            SystemMetricType::CpuUsage => system_metric::current_cpu_usage(),
        };
        if value < rule.trigger_count {
            return None;
        }
        match rule.strategy {
            AdaptiveStrategy::NoAdaptive => Some(value),
            AdaptiveStrategy::Bbr => {
                if Self::check_bbr() {
                    None
                } else {
                    Some(value)
                }
            }
        }
    }

    /// Admit while `concurrency <= max_observed_qps * min_rt_seconds`,
    /// the bandwidth-delay-product estimate of sustainable in-flight work.
    fn check_bbr() -> bool {
        let node = inbound_node();
        let concurrency = node.current_concurrency();
        if concurrency <= 1 {
            return true;
        }
        let min_rt_ms = node.min_rt();
        let max_complete_qps = node.max_avg(MetricEvent::Complete);
        f64::from(concurrency) <= max_complete_qps * min_rt_ms / 1000.0
    }
}

#[async_trait]
impl RuleCheckSlot for AdaptiveSystemSlot {
    fn order(&self) -> u32 {
        RULE_CHECK_SLOT_ORDER
    }

    async fn check(&self, ctx: &mut EntryContext) -> Option<Decision> {
        if ctx.resource.flow_type() != TrafficType::Inbound {
            return None;
        }
        for rule in get_active_rules().iter() {
            if let Some(snapshot) = Self::check_rule(rule) {
                return Some(Decision::Blocked(BlockError::with_cause(
                    BlockType::SystemFlow,
                    BLOCK_MSG,
                    rule.clone(),
                    Some(snapshot),
                )));
            }
        }
        None
    }
}
