//! Per-parameter traffic shaping: token-bucket rejection, paced
//! throttling, and concurrency capping keyed by argument value.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::block::{BlockError, BlockType};
use crate::chain::Decision;
use crate::clock;
use crate::context::{EntryContext, ParamValue};
use crate::hotspot::cache::{
    ParamCounterCache, ParamsMetric, CONCURRENCY_MAX_COUNT, PARAMS_CAPACITY_BASE,
    PARAMS_MAX_CAPACITY,
};
use crate::hotspot::rule::{ControlBehavior, HotspotRule, MetricType};

const BLOCK_MSG_QPS: &str = "hotspot QPS check blocked";
const BLOCK_MSG_CONCURRENCY: &str = "hotspot concurrency check blocked";
const BLOCK_MSG_QUEUEING: &str = "hotspot queueing time exceeds max queueing time";

/// One hot-spot rule materialised over its counter caches.
pub struct ParamFlowController {
    rule: Arc<HotspotRule>,
    metric: Arc<ParamsMetric>,
    specific_items: HashMap<ParamValue, i64>,
}

impl ParamFlowController {
    pub(crate) fn new(rule: Arc<HotspotRule>) -> Self {
        let metric = Arc::new(Self::build_metric(&rule));
        Self::with_metric(rule, metric)
    }

    /// Rebuild a controller around counters inherited from a replaced
    /// rule with a compatible shape.
    pub(crate) fn with_metric(rule: Arc<HotspotRule>, metric: Arc<ParamsMetric>) -> Self {
        let specific_items =
            rule.specific_items.iter().map(|i| (i.param.clone(), i.threshold)).collect();
        Self { rule, metric, specific_items }
    }

    fn build_metric(rule: &HotspotRule) -> ParamsMetric {
        match rule.metric_type {
            MetricType::Concurrency => ParamsMetric {
                concurrency_counter: Some(ParamCounterCache::new(CONCURRENCY_MAX_COUNT)),
                ..ParamsMetric::default()
            },
            MetricType::Qps => {
                let capacity = if rule.params_max_capacity > 0 {
                    PARAMS_MAX_CAPACITY.min(rule.params_max_capacity as usize)
                } else if rule.duration_in_sec == 0 {
                    PARAMS_MAX_CAPACITY
                } else {
                    PARAMS_MAX_CAPACITY
                        .min(PARAMS_CAPACITY_BASE.saturating_mul(rule.duration_in_sec as usize))
                };
                ParamsMetric {
                    rule_time_counter: Some(ParamCounterCache::new(capacity)),
                    rule_token_counter: Some(ParamCounterCache::new(capacity)),
                    ..ParamsMetric::default()
                }
            }
        }
    }

    pub fn bound_rule(&self) -> &Arc<HotspotRule> {
        &self.rule
    }

    pub(crate) fn bound_metric(&self) -> &Arc<ParamsMetric> {
        &self.metric
    }

    /// Select this rule's governing argument from the call input. The
    /// attachment key wins over the positional index; a negative index
    /// counts from the back.
    pub(crate) fn extract_arg(&self, ctx: &EntryContext) -> Option<ParamValue> {
        if !self.rule.param_key.is_empty() {
            if let Some(value) = ctx.input.attachments.get(&self.rule.param_key) {
                return Some(value.clone());
            }
        }
        let args = &ctx.input.args;
        let idx = self.rule.param_index;
        let resolved = if idx >= 0 {
            idx as usize
        } else {
            args.len().checked_sub(idx.unsigned_abs() as usize)?
        };
        args.get(resolved).cloned()
    }

    fn threshold_for(&self, arg: &ParamValue) -> i64 {
        self.specific_items.get(arg).copied().unwrap_or(self.rule.threshold)
    }

    /// Check one call against this rule for the given parameter value.
    pub(crate) fn perform_checking(&self, arg: &ParamValue, batch_count: u32) -> Option<Decision> {
        match self.rule.metric_type {
            MetricType::Concurrency => self.check_concurrency(arg, batch_count),
            MetricType::Qps => match self.rule.control_behavior {
                ControlBehavior::Reject => self.check_reject(arg, batch_count),
                ControlBehavior::Throttling => self.check_throttling(arg, batch_count),
            },
        }
    }

    fn blocked(&self, msg: &'static str, snapshot: Option<f64>) -> Option<Decision> {
        Some(Decision::Blocked(BlockError::with_cause(
            BlockType::HotSpotParamFlow,
            msg,
            self.rule.clone(),
            snapshot,
        )))
    }

    fn check_concurrency(&self, arg: &ParamValue, batch_count: u32) -> Option<Decision> {
        let counter = self.metric.concurrency_counter.as_ref()?;
        let Some(cur) = counter.add_if_absent(arg.clone(), 0) else {
            // First sighting of this parameter value.
            return None;
        };
        let concurrency = cur.load(Ordering::Acquire) + i64::from(batch_count);
        if concurrency <= self.threshold_for(arg) {
            return None;
        }
        self.blocked(BLOCK_MSG_CONCURRENCY, Some(concurrency as f64))
    }

    fn check_reject(&self, arg: &ParamValue, batch_count: u32) -> Option<Decision> {
        let time_counter = self.metric.rule_time_counter.as_ref()?;
        let token_counter = self.metric.rule_token_counter.as_ref()?;
        let token_count = self.threshold_for(arg);
        if token_count <= 0 {
            return self.blocked(BLOCK_MSG_QPS, Some(0.0));
        }
        let max_count = token_count + self.rule.burst_count;
        let batch = i64::from(batch_count);
        if batch > max_count {
            return self.blocked(BLOCK_MSG_QPS, Some(max_count as f64));
        }
        let duration_ms = self.rule.duration_in_sec * 1000;

        loop {
            let current_time_ms = clock::now_millis() as i64;
            let Some(last_add_time) = time_counter.add_if_absent(arg.clone(), current_time_ms)
            else {
                // First fill: take this batch out of a full bucket.
                token_counter.add_if_absent(arg.clone(), max_count - batch);
                return None;
            };
            let pass_time = current_time_ms - last_add_time.load(Ordering::Acquire);
            if pass_time > duration_ms {
                // A whole statistic window elapsed; lazily refill.
                let Some(old_qps) = token_counter.add_if_absent(arg.clone(), max_count - batch)
                else {
                    last_add_time.store(current_time_ms, Ordering::Release);
                    return None;
                };
                let rest_qps = old_qps.load(Ordering::Acquire);
                let to_add = pass_time * token_count / duration_ms;
                let new_qps = (to_add + rest_qps).min(max_count) - batch;
                if new_qps < 0 {
                    return self.blocked(BLOCK_MSG_QPS, Some(rest_qps as f64));
                }
                if old_qps
                    .compare_exchange(rest_qps, new_qps, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    last_add_time.store(current_time_ms, Ordering::Release);
                    return None;
                }
                std::thread::yield_now();
            } else {
                match token_counter.get(arg) {
                    Some(old_qps) => {
                        let rest = old_qps.load(Ordering::Acquire);
                        if rest - batch >= 0 {
                            if old_qps
                                .compare_exchange(
                                    rest,
                                    rest - batch,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                            {
                                return None;
                            }
                            std::thread::yield_now();
                        } else {
                            return self.blocked(BLOCK_MSG_QPS, Some(rest as f64));
                        }
                    }
                    None => std::thread::yield_now(),
                }
            }
        }
    }

    fn check_throttling(&self, arg: &ParamValue, batch_count: u32) -> Option<Decision> {
        let time_counter = self.metric.rule_time_counter.as_ref()?;
        let token_count = self.threshold_for(arg);
        if token_count <= 0 {
            return self.blocked(BLOCK_MSG_QPS, Some(0.0));
        }
        let interval_cost_ms = (f64::from(batch_count) * self.rule.duration_in_sec as f64 * 1000.0
            / token_count as f64)
            .round() as i64;

        loop {
            let current_time_ms = clock::now_millis() as i64;
            let Some(last_pass) = time_counter.add_if_absent(arg.clone(), current_time_ms) else {
                return None;
            };
            let last_pass_time = last_pass.load(Ordering::Acquire);
            let expected_time = last_pass_time + interval_cost_ms;
            if expected_time <= current_time_ms
                || expected_time - current_time_ms < self.rule.max_queueing_time_ms
            {
                if last_pass
                    .compare_exchange(
                        last_pass_time,
                        current_time_ms,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let await_time = expected_time - current_time_ms;
                    if await_time > 0 {
                        last_pass.store(expected_time, Ordering::Release);
                        return Some(Decision::Wait(Duration::from_millis(await_time as u64)));
                    }
                    return None;
                }
                std::thread::yield_now();
            } else {
                return self.blocked(BLOCK_MSG_QUEUEING, None);
            }
        }
    }
}
