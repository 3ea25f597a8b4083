//! Traffic shaping controller: one calculator plus one checker bound to a
//! rule, with an optional standalone statistic.

use std::sync::Arc;

use crate::chain::Decision;
use crate::flow::calculator::{ConstantCalculator, MemoryAdaptiveCalculator, WarmUpCalculator};
use crate::flow::checker::{RejectChecker, ThrottlingChecker};
use crate::flow::rule::{CalculateStrategy, ControlBehavior, FlowRule};
use crate::stat::metric_bucket::MetricLeapArray;
use crate::stat::sliding_window::SlidingWindowMetric;
use crate::stat::{NopReadStat, ReadStat};

/// Computes the currently allowed token threshold.
pub trait TrafficShapingCalculator: Send + Sync {
    fn calculate_allowed_tokens(&self, batch_count: u32, flag: i32) -> f64;
}

/// Decides pass/block/wait given the threshold and observed traffic.
pub trait TrafficShapingChecker: Send + Sync {
    /// `None` means pass with no opinion.
    fn do_check(&self, batch_count: u32, threshold: f64) -> Option<Decision>;
}

/// The statistic backing one controller. Either a read-only reuse of the
/// resource's global statistic, or a private leap array written by the
/// standalone stat slot.
#[derive(Clone)]
pub struct StandaloneStat {
    reuse_resource_stat: bool,
    read_only_metric: Arc<dyn ReadStat>,
    write_only_metric: Option<Arc<MetricLeapArray>>,
}

impl StandaloneStat {
    /// No statistic at all (throttling-only rules).
    pub(crate) fn nop() -> Self {
        Self {
            reuse_resource_stat: false,
            read_only_metric: Arc::new(NopReadStat),
            write_only_metric: None,
        }
    }

    /// Reuse a window over the resource's global statistic.
    pub(crate) fn reused(read_only_metric: Arc<dyn ReadStat>) -> Self {
        Self { reuse_resource_stat: true, read_only_metric, write_only_metric: None }
    }

    /// Private statistic, updated by the standalone stat slot on pass.
    pub(crate) fn standalone(
        window: Arc<SlidingWindowMetric>,
        array: Arc<MetricLeapArray>,
    ) -> Self {
        Self {
            reuse_resource_stat: false,
            read_only_metric: window,
            write_only_metric: Some(array),
        }
    }

    pub fn reuses_resource_stat(&self) -> bool {
        self.reuse_resource_stat
    }

    pub fn read_only_metric(&self) -> &Arc<dyn ReadStat> {
        &self.read_only_metric
    }

    pub fn write_only_metric(&self) -> Option<&Arc<MetricLeapArray>> {
        self.write_only_metric.as_ref()
    }
}

/// One flow rule materialised: calculator × checker × statistic.
pub struct TrafficShapingController {
    rule: Arc<FlowRule>,
    calculator: Box<dyn TrafficShapingCalculator>,
    checker: Box<dyn TrafficShapingChecker>,
    stat: StandaloneStat,
}

impl TrafficShapingController {
    pub(crate) fn new(rule: Arc<FlowRule>, stat: StandaloneStat) -> Self {
        let calculator: Box<dyn TrafficShapingCalculator> = match rule.token_calculate_strategy {
            CalculateStrategy::Constant => Box::new(ConstantCalculator::new(rule.threshold)),
            CalculateStrategy::WarmUp => {
                Box::new(WarmUpCalculator::new(&rule, stat.read_only_metric().clone()))
            }
            CalculateStrategy::MemoryAdaptive => Box::new(MemoryAdaptiveCalculator::new(&rule)),
        };
        let checker: Box<dyn TrafficShapingChecker> = match rule.control_behavior {
            ControlBehavior::Reject => {
                Box::new(RejectChecker::new(rule.clone(), stat.read_only_metric().clone()))
            }
            ControlBehavior::Throttling => Box::new(ThrottlingChecker::new(rule.clone())),
        };
        Self { rule, calculator, checker, stat }
    }

    pub fn bound_rule(&self) -> &Arc<FlowRule> {
        &self.rule
    }

    pub fn stat(&self) -> &StandaloneStat {
        &self.stat
    }

    /// Compute the live threshold, then check the call against it.
    pub fn perform_checking(&self, batch_count: u32, flag: i32) -> Option<Decision> {
        let allowed = self.calculator.calculate_allowed_tokens(batch_count, flag);
        self.checker.do_check(batch_count, allowed)
    }
}
