//! Flow rule-check slot and the standalone statistic recorder.

use std::sync::Arc;

use async_trait::async_trait;

use crate::block::BlockError;
use crate::chain::{Decision, RuleCheckSlot, StatSlot};
use crate::context::EntryContext;
use crate::flow::manager::get_traffic_controllers_for;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stat::MetricEvent;

pub(crate) const RULE_CHECK_SLOT_ORDER: u32 = 2000;
pub(crate) const STANDALONE_STAT_SLOT_ORDER: u32 = 1000;

/// Runs every flow controller bound to the resource, in load order.
/// A `Wait` verdict pauses the calling task for the computed duration and
/// then continues with the remaining controllers.
pub struct FlowSlot {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for FlowSlot {
    fn default() -> Self {
        Self { sleeper: Arc::new(TokioSleeper) }
    }
}

impl FlowSlot {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }
}

#[async_trait]
impl RuleCheckSlot for FlowSlot {
    fn order(&self) -> u32 {
        RULE_CHECK_SLOT_ORDER
    }

    async fn check(&self, ctx: &mut EntryContext) -> Option<Decision> {
        let resource = ctx.resource.name();
        if resource.is_empty() {
            return None;
        }
        let controllers = get_traffic_controllers_for(resource);
        let batch_count = ctx.input.batch_count;
        let flag = ctx.input.flag;
        for controller in controllers {
            match controller.perform_checking(batch_count, flag) {
                None | Some(Decision::Pass) => {}
                Some(Decision::Blocked(cause)) => return Some(Decision::Blocked(cause)),
                Some(Decision::Wait(wait)) => {
                    if !wait.is_zero() {
                        self.sleeper.sleep(wait).await;
                    }
                }
            }
        }
        None
    }
}

/// Writes pass counts into controllers that own a private statistic
/// (those not reusing the resource's global one).
pub struct StandaloneStatSlot;

impl StatSlot for StandaloneStatSlot {
    fn order(&self) -> u32 {
        STANDALONE_STAT_SLOT_ORDER
    }

    fn on_entry_passed(&self, ctx: &mut EntryContext) {
        let resource = ctx.resource.name();
        if resource.is_empty() {
            return;
        }
        for controller in get_traffic_controllers_for(resource) {
            if !controller.stat().reuses_resource_stat() {
                if let Some(writer) = controller.stat().write_only_metric() {
                    writer.add_count(MetricEvent::Pass, i64::from(ctx.input.batch_count));
                }
            }
        }
    }

    fn on_entry_blocked(&self, _ctx: &mut EntryContext, _cause: &BlockError) {}

    fn on_completed(&self, _ctx: &mut EntryContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::rule::{ControlBehavior, FlowRule};
    use crate::resource::{ResourceType, ResourceWrapper, TrafficType};
    use crate::sleeper::TrackingSleeper;

    fn ctx_for(resource: &str) -> EntryContext {
        let mut ctx = EntryContext::default();
        ctx.resource = Arc::new(ResourceWrapper::new(
            resource.into(),
            ResourceType::Common,
            TrafficType::Outbound,
        ));
        ctx
    }

    #[tokio::test]
    async fn no_rules_means_no_opinion() {
        let slot = FlowSlot::default();
        let mut ctx = ctx_for("flow_slot_no_rules");
        assert!(slot.check(&mut ctx).await.is_none());
    }

    #[tokio::test]
    async fn throttled_check_sleeps_and_continues() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        crate::flow::manager::load_rules(vec![FlowRule {
            resource: "flow_slot_throttle_test".into(),
            threshold: 10.0,
            control_behavior: ControlBehavior::Throttling,
            max_queueing_time_ms: 1000,
            stat_interval_in_ms: 1000,
            ..FlowRule::default()
        }])
        .unwrap();
        let sleeper = TrackingSleeper::new();
        let slot = FlowSlot::new(Arc::new(sleeper.clone()));
        let mut ctx = ctx_for("flow_slot_throttle_test");
        // First passes untouched, second is paced.
        assert!(slot.check(&mut ctx).await.is_none());
        assert!(slot.check(&mut ctx).await.is_none());
        assert_eq!(sleeper.calls().len(), 1);
        assert!(sleeper.calls()[0] <= std::time::Duration::from_millis(100));
    }
}
