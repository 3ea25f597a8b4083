//! System rule manager. Rules are global, not per resource.

use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::FloodgateError;
use crate::system::rule::SystemRule;

static RULES: OnceLock<ArcSwap<Vec<Arc<SystemRule>>>> = OnceLock::new();
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

fn rules() -> &'static ArcSwap<Vec<Arc<SystemRule>>> {
    RULES.get_or_init(|| ArcSwap::from_pointee(Vec::new()))
}

/// Replace the active system rule set. Invalid rules are logged and
/// skipped. Returns whether anything changed.
pub fn load_rules(new_rules: Vec<SystemRule>) -> Result<bool, FloodgateError> {
    let _guard = UPDATE_LOCK.lock();
    let current = rules().load_full();
    if current.len() == new_rules.len()
        && new_rules.iter().all(|r| current.iter().any(|c| c.as_ref() == r))
    {
        return Ok(false);
    }
    let mut installed = Vec::with_capacity(new_rules.len());
    for rule in new_rules {
        if let Err(e) = rule.is_valid() {
            tracing::warn!(error = %e, rule = %rule, "ignoring invalid system rule");
            continue;
        }
        installed.push(Arc::new(rule));
    }
    rules().store(Arc::new(installed));
    Ok(true)
}

pub fn get_rules() -> Vec<SystemRule> {
    rules().load().iter().map(|r| r.as_ref().clone()).collect()
}

pub fn clear_rules() {
    let _guard = UPDATE_LOCK.lock();
    rules().store(Arc::new(Vec::new()));
}

pub(crate) fn get_active_rules() -> Arc<Vec<Arc<SystemRule>>> {
    rules().load_full()
}
