//! Flow rule manager: validates, diffs and materialises rules into
//! controllers, preserving statistics across compatible reloads.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::config;
use crate::error::FloodgateError;
use crate::flow::controller::{StandaloneStat, TrafficShapingController};
use crate::flow::rule::{FlowRule, RelationStrategy};
use crate::resource::ResourceType;
use crate::stat::metric_bucket::MetricLeapArray;
use crate::stat::node::get_or_create_resource_node;
use crate::stat::sliding_window::SlidingWindowMetric;
use crate::stat::{check_validity_for_reuse_statistic, check_validity_for_statistic};

type ControllerMap = HashMap<String, Vec<Arc<TrafficShapingController>>>;

static CONTROLLERS: OnceLock<ArcSwap<ControllerMap>> = OnceLock::new();
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

fn controllers() -> &'static ArcSwap<ControllerMap> {
    CONTROLLERS.get_or_init(|| ArcSwap::from_pointee(ControllerMap::new()))
}

/// Replace the active flow rule set.
///
/// Returns whether anything changed. Rules equal to existing ones keep
/// their controllers; rules differing only in non-statistic fields keep
/// the underlying statistic; the rest get fresh controllers. Invalid
/// rules are logged and skipped.
pub fn load_rules(rules: Vec<FlowRule>) -> Result<bool, FloodgateError> {
    let _guard = UPDATE_LOCK.lock();
    let current = controllers().load_full();
    if rules_unchanged(&current, &rules) {
        return Ok(false);
    }

    let mut new_map = ControllerMap::new();
    for rule in rules {
        if let Err(e) = rule.is_valid() {
            tracing::warn!(error = %e, rule = %rule, "ignoring invalid flow rule");
            continue;
        }
        let rule = Arc::new(rule);
        let old_list = current.get(&rule.resource);

        let controller = if let Some(existing) =
            old_list.and_then(|l| l.iter().find(|c| *c.bound_rule().as_ref() == *rule))
        {
            existing.clone()
        } else if let Some(reusable) =
            old_list.and_then(|l| l.iter().find(|c| c.bound_rule().is_stat_reusable(&rule)))
        {
            Arc::new(TrafficShapingController::new(rule.clone(), reusable.stat().clone()))
        } else {
            match generate_stat_for(&rule) {
                Ok(stat) => Arc::new(TrafficShapingController::new(rule.clone(), stat)),
                Err(e) => {
                    tracing::warn!(error = %e, rule = %rule, "failed to build flow statistic");
                    continue;
                }
            }
        };
        new_map.entry(rule.resource.clone()).or_default().push(controller);
    }
    controllers().store(Arc::new(new_map));
    Ok(true)
}

/// Snapshot of the active rules.
pub fn get_rules() -> Vec<FlowRule> {
    let map = controllers().load();
    let mut rules: Vec<FlowRule> = map
        .values()
        .flat_map(|list| list.iter().map(|c| c.bound_rule().as_ref().clone()))
        .collect();
    rules.sort_by(|a, b| a.resource.cmp(&b.resource));
    rules
}

pub fn get_rules_of_resource(resource: &str) -> Vec<FlowRule> {
    controllers()
        .load()
        .get(resource)
        .map(|list| list.iter().map(|c| c.bound_rule().as_ref().clone()).collect())
        .unwrap_or_default()
}

/// Drop every flow rule.
pub fn clear_rules() {
    let _guard = UPDATE_LOCK.lock();
    controllers().store(Arc::new(ControllerMap::new()));
}

pub(crate) fn get_traffic_controllers_for(resource: &str) -> Vec<Arc<TrafficShapingController>> {
    controllers().load().get(resource).cloned().unwrap_or_default()
}

/// Order-insensitive comparison against the installed rule set.
fn rules_unchanged(current: &ControllerMap, new_rules: &[FlowRule]) -> bool {
    let current_rules: Vec<&Arc<FlowRule>> =
        current.values().flat_map(|l| l.iter().map(|c| c.bound_rule())).collect();
    if current_rules.len() != new_rules.len() {
        return false;
    }
    let mut used = vec![false; current_rules.len()];
    'outer: for rule in new_rules {
        for (i, existing) in current_rules.iter().enumerate() {
            if !used[i] && existing.as_ref() == rule {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

/// Build the standalone statistic for one rule:
///
/// - throttling-only rules carry no statistic;
/// - the default interval reuses the resource's read-only window;
/// - other intervals reuse a derived window when the resolutions are
///   compatible, and fall back to a private leap array otherwise.
fn generate_stat_for(rule: &Arc<FlowRule>) -> Result<StandaloneStat, FloodgateError> {
    if !rule.need_statistic() {
        return Ok(StandaloneStat::nop());
    }
    let interval = if rule.stat_interval_in_ms == 0 {
        config::metric_statistic_interval_ms()
    } else {
        rule.stat_interval_in_ms
    };
    let node_name = if rule.relation_strategy == RelationStrategy::AssociatedResource {
        &rule.ref_resource
    } else {
        &rule.resource
    };
    let node = get_or_create_resource_node(node_name, ResourceType::Common);

    if rule.stat_interval_in_ms == 0
        || rule.stat_interval_in_ms == config::metric_statistic_interval_ms()
    {
        return Ok(StandaloneStat::reused(node.default_metric().clone()));
    }

    let global_bucket_ms = config::global_statistic_bucket_length_ms();
    let sample_count = if interval > config::global_statistic_interval_ms_total()
        || interval < global_bucket_ms
        || interval % global_bucket_ms != 0
    {
        1
    } else {
        interval / global_bucket_ms
    };
    check_validity_for_statistic(sample_count, interval)?;

    match check_validity_for_reuse_statistic(
        sample_count,
        interval,
        node.global_sample_count(),
        node.global_interval_ms(),
    ) {
        Ok(()) => Ok(StandaloneStat::reused(Arc::new(
            node.generate_read_stat(sample_count, interval)?,
        ))),
        Err(FloodgateError::StatNotReusable { .. }) => {
            let array = Arc::new(MetricLeapArray::new(sample_count, interval)?);
            let window = Arc::new(SlidingWindowMetric::new(sample_count, interval, array.clone())?);
            Ok(StandaloneStat::standalone(window, array))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::rule::{CalculateStrategy, ControlBehavior};

    fn rule_for(resource: &str, threshold: f64) -> FlowRule {
        FlowRule { resource: resource.into(), threshold, ..FlowRule::default() }
    }

    #[test]
    fn reload_of_identical_rules_is_a_noop() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let rules = vec![rule_for("flow_mgr_noop", 5.0)];
        assert!(load_rules(rules).unwrap());
        let installed = get_rules_of_resource("flow_mgr_noop");
        assert!(!load_rules(get_rules()).unwrap(), "reloading the snapshot must be a no-op");
        assert_eq!(get_rules_of_resource("flow_mgr_noop"), installed);
    }

    #[test]
    fn reordered_rules_keep_controllers() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let a = rule_for("flow_mgr_reorder", 1.0);
        let b = rule_for("flow_mgr_reorder", 2.0);
        load_rules(vec![a.clone(), b.clone()]).unwrap();
        let before = get_traffic_controllers_for("flow_mgr_reorder");
        load_rules(vec![b, a]).unwrap();
        let after = get_traffic_controllers_for("flow_mgr_reorder");
        assert_eq!(before.len(), 2);
        // Same controllers survive, possibly in a different order.
        for controller in &after {
            assert!(before.iter().any(|c| Arc::ptr_eq(c, controller)));
        }
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let good = rule_for("flow_mgr_skip", 1.0);
        let bad = rule_for("", 1.0);
        assert!(load_rules(vec![good, bad]).unwrap());
        assert_eq!(get_rules_of_resource("flow_mgr_skip").len(), 1);
    }

    #[test]
    fn throttling_only_rules_get_nop_stat() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let rule = FlowRule {
            resource: "flow_mgr_nop_stat".into(),
            threshold: 10.0,
            control_behavior: ControlBehavior::Throttling,
            ..FlowRule::default()
        };
        load_rules(vec![rule]).unwrap();
        let tcs = get_traffic_controllers_for("flow_mgr_nop_stat");
        assert_eq!(tcs.len(), 1);
        assert!(!tcs[0].stat().reuses_resource_stat());
        assert!(tcs[0].stat().write_only_metric().is_none());
    }

    #[test]
    fn default_interval_reuses_the_resource_window() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let rule = rule_for("flow_mgr_reuse_default", 10.0);
        load_rules(vec![rule]).unwrap();
        let tcs = get_traffic_controllers_for("flow_mgr_reuse_default");
        assert!(tcs[0].stat().reuses_resource_stat());
    }

    #[test]
    fn incompatible_interval_gets_private_array() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let mut rule = rule_for("flow_mgr_private", 10.0);
        rule.stat_interval_in_ms = 100; // below the 500ms global bucket
        load_rules(vec![rule]).unwrap();
        let tcs = get_traffic_controllers_for("flow_mgr_private");
        assert!(!tcs[0].stat().reuses_resource_stat());
        assert!(tcs[0].stat().write_only_metric().is_some());
    }

    #[test]
    fn warm_up_rules_build_controllers() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let rule = FlowRule {
            resource: "flow_mgr_warmup".into(),
            threshold: 100.0,
            token_calculate_strategy: CalculateStrategy::WarmUp,
            warm_up_period_sec: 10,
            warm_up_cold_factor: 3,
            ..FlowRule::default()
        };
        assert!(load_rules(vec![rule]).unwrap());
        assert_eq!(get_traffic_controllers_for("flow_mgr_warmup").len(), 1);
    }
}
