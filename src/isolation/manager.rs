//! Isolation rule manager.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::FloodgateError;
use crate::isolation::rule::IsolationRule;

type RuleMap = HashMap<String, Vec<Arc<IsolationRule>>>;

static RULES: OnceLock<ArcSwap<RuleMap>> = OnceLock::new();
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

fn rules() -> &'static ArcSwap<RuleMap> {
    RULES.get_or_init(|| ArcSwap::from_pointee(RuleMap::new()))
}

/// Replace the active isolation rule set. Invalid rules are logged and
/// skipped. Returns whether anything changed.
pub fn load_rules(new_rules: Vec<IsolationRule>) -> Result<bool, FloodgateError> {
    let _guard = UPDATE_LOCK.lock();
    let current = rules().load_full();
    let current_rules: Vec<&Arc<IsolationRule>> = current.values().flatten().collect();
    if current_rules.len() == new_rules.len()
        && new_rules.iter().all(|r| current_rules.iter().any(|c| c.as_ref() == r))
    {
        return Ok(false);
    }

    let mut map = RuleMap::new();
    for rule in new_rules {
        if let Err(e) = rule.is_valid() {
            tracing::warn!(error = %e, rule = %rule, "ignoring invalid isolation rule");
            continue;
        }
        map.entry(rule.resource.clone()).or_default().push(Arc::new(rule));
    }
    rules().store(Arc::new(map));
    Ok(true)
}

pub fn get_rules() -> Vec<IsolationRule> {
    let mut out: Vec<IsolationRule> =
        rules().load().values().flatten().map(|r| r.as_ref().clone()).collect();
    out.sort_by(|a, b| a.resource.cmp(&b.resource));
    out
}

pub fn clear_rules() {
    let _guard = UPDATE_LOCK.lock();
    rules().store(Arc::new(RuleMap::new()));
}

pub(crate) fn get_rules_of_resource(resource: &str) -> Vec<Arc<IsolationRule>> {
    rules().load().get(resource).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_reload() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        let rule =
            IsolationRule { resource: "iso_mgr_test".into(), threshold: 4, ..Default::default() };
        assert!(load_rules(vec![rule.clone()]).unwrap());
        assert!(!load_rules(get_rules()).unwrap());
        assert_eq!(get_rules_of_resource("iso_mgr_test").len(), 1);
        clear_rules();
        assert!(get_rules_of_resource("iso_mgr_test").is_empty());
    }
}
