//! Isolation rule-check slot.

use async_trait::async_trait;

use crate::block::{BlockError, BlockType};
use crate::chain::{Decision, RuleCheckSlot};
use crate::context::EntryContext;
use crate::isolation::manager::get_rules_of_resource;
use crate::isolation::rule::IsolationMetricType;

pub(crate) const RULE_CHECK_SLOT_ORDER: u32 = 3000;

const BLOCK_MSG: &str = "concurrency exceeds threshold";

/// Blocks when the resource's in-flight count plus this batch would exceed
/// any isolation rule's threshold.
pub struct IsolationSlot;

#[async_trait]
impl RuleCheckSlot for IsolationSlot {
    fn order(&self) -> u32 {
        RULE_CHECK_SLOT_ORDER
    }

    async fn check(&self, ctx: &mut EntryContext) -> Option<Decision> {
        let resource = ctx.resource.name();
        if resource.is_empty() {
            return None;
        }
        let node = ctx.stat_node.as_ref()?;
        let batch_count = ctx.input.batch_count;
        for rule in get_rules_of_resource(resource) {
            if rule.metric_type != IsolationMetricType::Concurrency {
                continue;
            }
            let cur = node.current_concurrency();
            let cur = if cur >= 0 {
                cur as u32
            } else {
                tracing::error!(resource, concurrency = cur, "negative concurrency observed");
                0
            };
            if cur + batch_count > rule.threshold {
                return Some(Decision::Blocked(BlockError::with_cause(
                    BlockType::Isolation,
                    BLOCK_MSG,
                    rule.clone(),
                    Some(f64::from(cur)),
                )));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::rule::IsolationRule;
    use crate::resource::{ResourceType, ResourceWrapper, TrafficType};
    use crate::stat::node::get_or_create_resource_node;
    use std::sync::Arc;

    fn ctx_for(resource: &str) -> EntryContext {
        let mut ctx = EntryContext::default();
        ctx.resource = Arc::new(ResourceWrapper::new(
            resource.into(),
            ResourceType::Common,
            TrafficType::Outbound,
        ));
        ctx.stat_node = Some(get_or_create_resource_node(resource, ResourceType::Common));
        ctx
    }

    #[tokio::test]
    async fn blocks_at_the_cap_and_recovers() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        crate::isolation::manager::load_rules(vec![IsolationRule {
            resource: "iso_slot_test".into(),
            threshold: 2,
            ..Default::default()
        }])
        .unwrap();

        let mut ctx = ctx_for("iso_slot_test");
        let node = ctx.stat_node.clone().unwrap();
        let slot = IsolationSlot;

        assert!(slot.check(&mut ctx).await.is_none());
        node.increase_concurrency();
        node.increase_concurrency();
        let decision = slot.check(&mut ctx).await.unwrap();
        assert!(decision.is_blocked());
        assert_eq!(decision.blocked_cause().unwrap().block_type(), BlockType::Isolation);

        node.decrease_concurrency();
        assert!(slot.check(&mut ctx).await.is_none());
        node.decrease_concurrency();
    }
}
