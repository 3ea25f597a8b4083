//! Hot-spot rule-check slot and per-parameter concurrency bookkeeping.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::block::BlockError;
use crate::chain::{Decision, RuleCheckSlot, StatSlot};
use crate::context::EntryContext;
use crate::hotspot::manager::get_traffic_controllers_for;
use crate::hotspot::rule::MetricType;
use crate::sleeper::{Sleeper, TokioSleeper};

pub(crate) const RULE_CHECK_SLOT_ORDER: u32 = 4000;
pub(crate) const CONCURRENCY_STAT_SLOT_ORDER: u32 = 4000;

/// Runs every hot-spot controller of the resource against the argument it
/// selects; paced verdicts sleep in place and continue.
pub struct HotspotSlot {
    sleeper: Arc<dyn Sleeper>,
}

impl Default for HotspotSlot {
    fn default() -> Self {
        Self { sleeper: Arc::new(TokioSleeper) }
    }
}

impl HotspotSlot {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }
}

#[async_trait]
impl RuleCheckSlot for HotspotSlot {
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
        for controller in controllers {
            let Some(arg) = controller.extract_arg(ctx) else {
                continue;
            };
            match controller.perform_checking(&arg, batch_count) {
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

/// Keeps the per-parameter concurrency counters balanced: increment on
/// pass, decrement on completion. Blocked entries touch nothing.
pub struct HotspotConcurrencyStatSlot;

impl HotspotConcurrencyStatSlot {
    fn adjust(ctx: &mut EntryContext, delta: i64) {
        let resource = ctx.resource.name();
        if resource.is_empty() {
            return;
        }
        for controller in get_traffic_controllers_for(resource) {
            if controller.bound_rule().metric_type != MetricType::Concurrency {
                continue;
            }
            let Some(arg) = controller.extract_arg(ctx) else {
                continue;
            };
            let Some(counter) =
                controller.bound_metric().concurrency_counter.as_ref().and_then(|c| c.get(&arg))
            else {
                tracing::debug!(%arg, "parameter missing from concurrency counter");
                continue;
            };
            counter.fetch_add(delta, Ordering::AcqRel);
        }
    }
}

impl StatSlot for HotspotConcurrencyStatSlot {
    fn order(&self) -> u32 {
        CONCURRENCY_STAT_SLOT_ORDER
    }

    fn on_entry_passed(&self, ctx: &mut EntryContext) {
        Self::adjust(ctx, 1);
    }

    fn on_entry_blocked(&self, _ctx: &mut EntryContext, _cause: &BlockError) {}

    fn on_completed(&self, ctx: &mut EntryContext) {
        Self::adjust(ctx, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ParamValue;
    use crate::hotspot::rule::HotspotRule;
    use crate::resource::{ResourceType, ResourceWrapper, TrafficType};

    fn ctx_with_arg(resource: &str, arg: &str) -> EntryContext {
        let mut ctx = EntryContext::default();
        ctx.resource = Arc::new(ResourceWrapper::new(
            resource.into(),
            ResourceType::Common,
            TrafficType::Outbound,
        ));
        ctx.input.args.push(ParamValue::from(arg));
        ctx
    }

    #[tokio::test]
    async fn concurrency_counters_balance_across_lifecycle() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        crate::hotspot::manager::load_rules(vec![HotspotRule {
            resource: "hs_slot_balance".into(),
            metric_type: MetricType::Concurrency,
            threshold: 5,
            param_index: 0,
            ..Default::default()
        }])
        .unwrap();

        let slot = HotspotSlot::default();
        let mut ctx = ctx_with_arg("hs_slot_balance", "A");
        assert!(slot.check(&mut ctx).await.is_none());

        HotspotConcurrencyStatSlot.on_entry_passed(&mut ctx);
        let controller = &get_traffic_controllers_for("hs_slot_balance")[0];
        let counter = controller
            .bound_metric()
            .concurrency_counter
            .as_ref()
            .unwrap()
            .get(&ParamValue::from("A"))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        HotspotConcurrencyStatSlot.on_completed(&mut ctx);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
