//! Circuit-breaker rule-check slot and the completion recorder.

use async_trait::async_trait;

use crate::block::{BlockError, BlockType};
use crate::chain::{Decision, RuleCheckSlot, StatSlot};
use crate::circuitbreaker::manager::get_breakers_of_resource;
use crate::context::EntryContext;

pub(crate) const RULE_CHECK_SLOT_ORDER: u32 = 5000;
pub(crate) const METRIC_STAT_SLOT_ORDER: u32 = 5000;

const BLOCK_MSG: &str = "circuit breaker check blocked";

/// Asks every breaker on the resource for permission; the first refusal
/// blocks the call.
pub struct CircuitBreakerSlot;

#[async_trait]
impl RuleCheckSlot for CircuitBreakerSlot {
    fn order(&self) -> u32 {
        RULE_CHECK_SLOT_ORDER
    }

    async fn check(&self, ctx: &mut EntryContext) -> Option<Decision> {
        let resource = ctx.resource.name().to_string();
        if resource.is_empty() {
            return None;
        }
        for breaker in get_breakers_of_resource(&resource) {
            if !breaker.try_pass(ctx) {
                return Some(Decision::Blocked(BlockError::with_cause(
                    BlockType::CircuitBreaking,
                    BLOCK_MSG,
                    breaker.bound_rule().clone(),
                    None,
                )));
            }
        }
        None
    }
}

fn plain_error(
    err: &std::sync::Arc<dyn std::error::Error + Send + Sync>,
) -> &(dyn std::error::Error + 'static) {
    &**err
}

/// Feeds each passed call's RT and error into the resource's breakers at
/// completion. Blocked calls never reach this.
pub struct CircuitBreakerMetricStatSlot;

impl StatSlot for CircuitBreakerMetricStatSlot {
    fn order(&self) -> u32 {
        METRIC_STAT_SLOT_ORDER
    }

    fn on_entry_passed(&self, _ctx: &mut EntryContext) {}

    fn on_entry_blocked(&self, _ctx: &mut EntryContext, _cause: &BlockError) {}

    fn on_completed(&self, ctx: &mut EntryContext) {
        let resource = ctx.resource.name().to_string();
        if resource.is_empty() {
            return;
        }
        let rt = ctx.round_trip_ms();
        let error = ctx.error().map(plain_error);
        for breaker in get_breakers_of_resource(&resource) {
            breaker.on_request_complete(rt, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuitbreaker::manager::load_rules;
    use crate::circuitbreaker::rule::{BreakerStrategy, CircuitBreakerRule};
    use crate::circuitbreaker::State;
    use crate::resource::{ResourceType, ResourceWrapper, TrafficType};
    use std::sync::Arc;

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
    async fn blocked_once_open_via_completions() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        load_rules(vec![CircuitBreakerRule {
            resource: "cb_slot_test".into(),
            strategy: BreakerStrategy::ErrorCount,
            retry_timeout_ms: 10_000,
            min_request_amount: 1,
            stat_interval_ms: 1000,
            threshold: 2.0,
            probe_num: 1,
            ..Default::default()
        }])
        .unwrap();

        let slot = CircuitBreakerSlot;
        let stat_slot = CircuitBreakerMetricStatSlot;
        let mut ctx = ctx_for("cb_slot_test");
        assert!(slot.check(&mut ctx).await.is_none());

        for _ in 0..2 {
            let mut done = ctx_for("cb_slot_test");
            done.start_time = crate::clock::now_millis();
            done.set_error(Arc::new(std::io::Error::other("boom")));
            stat_slot.on_completed(&mut done);
        }
        let breaker = &get_breakers_of_resource("cb_slot_test")[0];
        assert_eq!(breaker.current_state(), State::Open);

        let decision = slot.check(&mut ctx).await.unwrap();
        assert_eq!(decision.blocked_cause().unwrap().block_type(), BlockType::CircuitBreaking);
    }
}
