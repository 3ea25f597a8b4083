//! Hot-spot rule manager.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::FloodgateError;
use crate::hotspot::controller::ParamFlowController;
use crate::hotspot::rule::HotspotRule;

type ControllerMap = HashMap<String, Vec<Arc<ParamFlowController>>>;

static CONTROLLERS: OnceLock<ArcSwap<ControllerMap>> = OnceLock::new();
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

fn controllers() -> &'static ArcSwap<ControllerMap> {
    CONTROLLERS.get_or_init(|| ArcSwap::from_pointee(ControllerMap::new()))
}

/// Replace the active hot-spot rule set. Controllers for unchanged rules
/// survive; rules with a compatible counter shape keep their caches;
/// invalid rules are logged and skipped.
pub fn load_rules(rules: Vec<HotspotRule>) -> Result<bool, FloodgateError> {
    let _guard = UPDATE_LOCK.lock();
    let current = controllers().load_full();
    let current_rules: Vec<&Arc<HotspotRule>> =
        current.values().flat_map(|l| l.iter().map(|c| c.bound_rule())).collect();
    if current_rules.len() == rules.len()
        && rules.iter().all(|r| current_rules.iter().any(|c| c.as_ref() == r))
    {
        return Ok(false);
    }

    let mut new_map = ControllerMap::new();
    for rule in rules {
        if let Err(e) = rule.is_valid() {
            tracing::warn!(error = %e, rule = %rule, "ignoring invalid hotspot rule");
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
            Arc::new(ParamFlowController::with_metric(rule.clone(), reusable.bound_metric().clone()))
        } else {
            Arc::new(ParamFlowController::new(rule.clone()))
        };
        new_map.entry(rule.resource.clone()).or_default().push(controller);
    }
    controllers().store(Arc::new(new_map));
    Ok(true)
}

pub fn get_rules() -> Vec<HotspotRule> {
    let mut rules: Vec<HotspotRule> = controllers()
        .load()
        .values()
        .flat_map(|l| l.iter().map(|c| c.bound_rule().as_ref().clone()))
        .collect();
    rules.sort_by(|a, b| a.resource.cmp(&b.resource));
    rules
}

pub fn clear_rules() {
    let _guard = UPDATE_LOCK.lock();
    controllers().store(Arc::new(ControllerMap::new()));
}

pub(crate) fn get_traffic_controllers_for(resource: &str) -> Vec<Arc<ParamFlowController>> {
    controllers().load().get(resource).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotspot::rule::MetricType;

    fn rule_for(resource: &str, threshold: i64) -> HotspotRule {
        HotspotRule {
            resource: resource.into(),
            metric_type: MetricType::Qps,
            threshold,
            duration_in_sec: 1,
            ..Default::default()
        }
    }

    #[test]
    fn reload_preserves_identical_controllers() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        load_rules(vec![rule_for("hs_mgr_keep", 5)]).unwrap();
        let before = get_traffic_controllers_for("hs_mgr_keep");
        assert!(!load_rules(get_rules()).unwrap());
        let after = get_traffic_controllers_for("hs_mgr_keep");
        assert!(Arc::ptr_eq(&before[0], &after[0]));
    }

    #[test]
    fn threshold_change_keeps_counters() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        load_rules(vec![rule_for("hs_mgr_reuse", 5)]).unwrap();
        let old_metric = get_traffic_controllers_for("hs_mgr_reuse")[0].bound_metric().clone();
        load_rules(vec![rule_for("hs_mgr_reuse", 50)]).unwrap();
        let new_controller = &get_traffic_controllers_for("hs_mgr_reuse")[0];
        assert!(Arc::ptr_eq(&old_metric, new_controller.bound_metric()));
        assert_eq!(new_controller.bound_rule().threshold, 50);
    }

    #[test]
    fn invalid_rules_are_dropped() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let mut bad = rule_for("hs_mgr_invalid", 5);
        bad.duration_in_sec = 0;
        load_rules(vec![bad]).unwrap();
        assert!(get_traffic_controllers_for("hs_mgr_invalid").is_empty());
    }
}
