//! Circuit-breaker rule manager.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::circuitbreaker::breaker::CircuitBreaker;
use crate::circuitbreaker::rule::{BreakerStrategy, CircuitBreakerRule};
use crate::circuitbreaker::strategies::{
    ErrorCountBreaker, ErrorCounter, ErrorRatioBreaker, SlowRequestCounter, SlowRtBreaker,
};
use crate::error::FloodgateError;
use crate::stat::leap_array::LeapArray;

type BreakerMap = HashMap<String, Vec<Arc<dyn CircuitBreaker>>>;

static BREAKERS: OnceLock<ArcSwap<BreakerMap>> = OnceLock::new();
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

fn breakers() -> &'static ArcSwap<BreakerMap> {
    BREAKERS.get_or_init(|| ArcSwap::from_pointee(BreakerMap::new()))
}

/// Replace the active circuit-breaking rule set.
///
/// Unchanged rules keep their breakers (state machine included); rules
/// with the same window shape keep their statistic but restart the state
/// machine; the rest start fresh. Invalid rules are logged and skipped.
pub fn load_rules(rules: Vec<CircuitBreakerRule>) -> Result<bool, FloodgateError> {
    let _guard = UPDATE_LOCK.lock();
    let current = breakers().load_full();
    let current_rules: Vec<&Arc<CircuitBreakerRule>> =
        current.values().flat_map(|l| l.iter().map(|b| b.bound_rule())).collect();
    if current_rules.len() == rules.len()
        && rules.iter().all(|r| current_rules.iter().any(|c| c.as_ref() == r))
    {
        return Ok(false);
    }

    let mut new_map = BreakerMap::new();
    for rule in rules {
        if let Err(e) = rule.is_valid() {
            tracing::warn!(error = %e, rule = %rule, "ignoring invalid circuit-breaker rule");
            continue;
        }
        let rule = Arc::new(rule);
        let old_list = current.get(&rule.resource);

        let breaker = if let Some(existing) =
            old_list.and_then(|l| l.iter().find(|b| *b.bound_rule().as_ref() == *rule))
        {
            existing.clone()
        } else {
            let reusable_stat = old_list
                .and_then(|l| l.iter().find(|b| b.bound_rule().is_stat_reusable(&rule)))
                .map(|b| b.bound_stat());
            match build_breaker(rule.clone(), reusable_stat) {
                Ok(breaker) => breaker,
                Err(e) => {
                    tracing::warn!(error = %e, rule = %rule, "failed to build circuit breaker");
                    continue;
                }
            }
        };
        new_map.entry(rule.resource.clone()).or_default().push(breaker);
    }
    breakers().store(Arc::new(new_map));
    Ok(true)
}

fn build_breaker(
    rule: Arc<CircuitBreakerRule>,
    reusable_stat: Option<Arc<dyn std::any::Any + Send + Sync>>,
) -> Result<Arc<dyn CircuitBreaker>, FloodgateError> {
    match rule.strategy {
        BreakerStrategy::SlowRequestRatio => {
            if let Some(stat) = reusable_stat
                .and_then(|s| s.downcast::<LeapArray<SlowRequestCounter>>().ok())
            {
                return Ok(Arc::new(SlowRtBreaker::with_stat(rule, stat)));
            }
            Ok(Arc::new(SlowRtBreaker::new(rule)?))
        }
        BreakerStrategy::ErrorRatio => {
            if let Some(stat) =
                reusable_stat.and_then(|s| s.downcast::<LeapArray<ErrorCounter>>().ok())
            {
                return Ok(Arc::new(ErrorRatioBreaker::with_stat(rule, stat)));
            }
            Ok(Arc::new(ErrorRatioBreaker::new(rule)?))
        }
        BreakerStrategy::ErrorCount => {
            if let Some(stat) =
                reusable_stat.and_then(|s| s.downcast::<LeapArray<ErrorCounter>>().ok())
            {
                return Ok(Arc::new(ErrorCountBreaker::with_stat(rule, stat)));
            }
            Ok(Arc::new(ErrorCountBreaker::new(rule)?))
        }
    }
}

pub fn get_rules() -> Vec<CircuitBreakerRule> {
    let mut rules: Vec<CircuitBreakerRule> = breakers()
        .load()
        .values()
        .flat_map(|l| l.iter().map(|b| b.bound_rule().as_ref().clone()))
        .collect();
    rules.sort_by(|a, b| a.resource.cmp(&b.resource));
    rules
}

pub fn clear_rules() {
    let _guard = UPDATE_LOCK.lock();
    breakers().store(Arc::new(BreakerMap::new()));
}

pub(crate) fn get_breakers_of_resource(resource: &str) -> Vec<Arc<dyn CircuitBreaker>> {
    breakers().load().get(resource).cloned().unwrap_or_default()
}
