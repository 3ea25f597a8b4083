//! Check behaviours: immediate rejection and paced-release throttling.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::block::{BlockError, BlockType};
use crate::chain::Decision;
use crate::clock;
use crate::flow::controller::TrafficShapingChecker;
use crate::flow::rule::FlowRule;
use crate::stat::{MetricEvent, ReadStat};

const BLOCK_MSG_REJECT: &str = "flow reject check blocked";
const BLOCK_MSG_QUEUEING: &str =
    "flow throttling check blocked, estimated queueing time exceeds max queueing time";

const MILLIS_TO_NANOS: i64 = 1_000_000;

/// Blocks when the passed count in the controller's window plus this batch
/// would exceed the threshold.
pub struct RejectChecker {
    rule: Arc<FlowRule>,
    read_stat: Arc<dyn ReadStat>,
}

impl RejectChecker {
    pub(crate) fn new(rule: Arc<FlowRule>, read_stat: Arc<dyn ReadStat>) -> Self {
        Self { rule, read_stat }
    }
}

impl TrafficShapingChecker for RejectChecker {
    fn do_check(&self, batch_count: u32, threshold: f64) -> Option<Decision> {
        let cur_count = self.read_stat.sum(MetricEvent::Pass) as f64;
        if cur_count + f64::from(batch_count) > threshold {
            return Some(Decision::Blocked(BlockError::with_cause(
                BlockType::Flow,
                BLOCK_MSG_REJECT,
                self.rule.clone(),
                Some(cur_count),
            )));
        }
        None
    }
}

/// Treats the rule as a steady emitter: each request reserves a pass slot
/// `batch/threshold * interval` after the previous one, waiting in place
/// when the reservation is near and blocking when the projected wait
/// exceeds the bound.
///
/// `last_passed_time` is exclusively owned by this checker; no other
/// component writes it.
pub struct ThrottlingChecker {
    rule: Arc<FlowRule>,
    max_queueing_time_ns: i64,
    stat_interval_ns: i64,
    last_passed_time: AtomicI64,
}

impl ThrottlingChecker {
    pub(crate) fn new(rule: Arc<FlowRule>) -> Self {
        let stat_interval_ns = if rule.stat_interval_in_ms == 0 {
            1000 * MILLIS_TO_NANOS
        } else {
            i64::from(rule.stat_interval_in_ms) * MILLIS_TO_NANOS
        };
        Self {
            max_queueing_time_ns: i64::from(rule.max_queueing_time_ms) * MILLIS_TO_NANOS,
            stat_interval_ns,
            last_passed_time: AtomicI64::new(0),
            rule,
        }
    }
}

impl TrafficShapingChecker for ThrottlingChecker {
    fn do_check(&self, batch_count: u32, threshold: f64) -> Option<Decision> {
        if batch_count == 0 {
            return None;
        }
        if threshold <= 0.0 {
            return Some(Decision::Blocked(BlockError::with_cause(
                BlockType::Flow,
                "flow throttling check blocked, threshold is <= 0.0",
                self.rule.clone(),
                None,
            )));
        }
        if f64::from(batch_count) > threshold {
            return Some(Decision::Blocked(BlockError::new(BlockType::Flow)));
        }

        // Nanosecond resolution keeps the queueing estimate accurate.
        let cur_nano = clock::now_nanos() as i64;
        let interval_ns =
            (f64::from(batch_count) / threshold * self.stat_interval_ns as f64).ceil() as i64;

        let loaded_last_passed = self.last_passed_time.load(Ordering::Acquire);
        let expected_time = loaded_last_passed + interval_ns;
        if expected_time <= cur_nano {
            if self
                .last_passed_time
                .compare_exchange(loaded_last_passed, cur_nano, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return None;
            }
        }

        let estimated_queueing =
            self.last_passed_time.load(Ordering::Acquire) + interval_ns - cur_nano;
        if estimated_queueing > self.max_queueing_time_ns {
            return Some(Decision::Blocked(BlockError::with_cause(
                BlockType::Flow,
                BLOCK_MSG_QUEUEING,
                self.rule.clone(),
                None,
            )));
        }

        // Reserve our pass slot, then re-check: a racing reservation may
        // have pushed the projected wait past the bound.
        let old_time = self.last_passed_time.fetch_add(interval_ns, Ordering::AcqRel) + interval_ns;
        let estimated_queueing = old_time - cur_nano;
        if estimated_queueing > self.max_queueing_time_ns {
            self.last_passed_time.fetch_sub(interval_ns, Ordering::AcqRel);
            return Some(Decision::Blocked(BlockError::with_cause(
                BlockType::Flow,
                BLOCK_MSG_QUEUEING,
                self.rule.clone(),
                None,
            )));
        }
        if estimated_queueing > 0 {
            Some(Decision::Wait(Duration::from_nanos(estimated_queueing as u64)))
        } else {
            Some(Decision::Wait(Duration::ZERO))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::NopReadStat;

    fn throttling_rule(threshold_note: &str, max_queueing_time_ms: u32) -> Arc<FlowRule> {
        Arc::new(FlowRule {
            resource: threshold_note.into(),
            control_behavior: crate::flow::rule::ControlBehavior::Throttling,
            max_queueing_time_ms,
            stat_interval_in_ms: 1000,
            ..FlowRule::default()
        })
    }

    #[test]
    fn reject_snapshot_carries_observed_count() {
        let rule = Arc::new(FlowRule { resource: "r".into(), ..FlowRule::default() });
        let checker = RejectChecker::new(rule, Arc::new(NopReadStat));
        let decision = checker.do_check(1, 0.0).unwrap();
        let cause = decision.blocked_cause().unwrap();
        assert_eq!(cause.block_type(), BlockType::Flow);
        assert_eq!(cause.triggered_value(), Some(0.0));
    }

    #[test]
    fn throttling_first_request_passes_immediately() {
        let checker = ThrottlingChecker::new(throttling_rule("t1", 500));
        assert!(checker.do_check(1, 10.0).is_none());
    }

    #[test]
    fn throttling_paces_subsequent_requests() {
        let checker = ThrottlingChecker::new(throttling_rule("t2", 1000));
        assert!(checker.do_check(1, 10.0).is_none());
        // Second request 100ms behind the emitter: wait in (0, 100ms].
        let decision = checker.do_check(1, 10.0).unwrap();
        let wait = decision.wait_duration().expect("should queue, not block");
        assert!(wait <= Duration::from_millis(100), "wait was {:?}", wait);
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn throttling_blocks_when_queue_is_full() {
        let checker = ThrottlingChecker::new(throttling_rule("t3", 150));
        assert!(checker.do_check(1, 10.0).is_none());
        // Each reservation adds 100ms; the queue holds at most one
        // in-flight wait beyond 150ms.
        let mut waits = 0;
        let mut blocks = 0;
        for _ in 0..4 {
            match checker.do_check(1, 10.0) {
                Some(Decision::Wait(_)) => waits += 1,
                Some(Decision::Blocked(cause)) => {
                    assert!(cause.block_msg().contains("queueing"));
                    blocks += 1;
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }
        assert!(waits >= 1);
        assert!(blocks >= 1);
    }

    #[test]
    fn throttling_rejects_oversized_batch() {
        let checker = ThrottlingChecker::new(throttling_rule("t4", 500));
        let decision = checker.do_check(20, 10.0).unwrap();
        assert!(decision.is_blocked());
    }

    #[test]
    fn throttling_blocks_on_zero_threshold() {
        let checker = ThrottlingChecker::new(throttling_rule("t5", 500));
        let decision = checker.do_check(1, 0.0).unwrap();
        assert!(decision.is_blocked());
    }
}
