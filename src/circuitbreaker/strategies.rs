//! The three breaker strategies: slow-request ratio, error ratio and
//! error count, each over its own counter leap array.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::circuitbreaker::breaker::{BreakerState, CircuitBreaker, State};
use crate::circuitbreaker::rule::CircuitBreakerRule;
use crate::context::EntryContext;
use crate::error::FloodgateError;
use crate::stat::leap_array::LeapArray;
use crate::util::{float64_equals, LogThrottle};

static STAT_LOG_THROTTLE: LogThrottle = LogThrottle::new(60_000);

/// Per-bucket counters of the slow-request strategy.
#[derive(Default)]
pub struct SlowRequestCounter {
    slow_count: AtomicU64,
    total_count: AtomicU64,
}

impl SlowRequestCounter {
    fn reset(&self) {
        self.slow_count.store(0, Ordering::Release);
        self.total_count.store(0, Ordering::Release);
    }
}

/// Per-bucket counters of the error strategies.
#[derive(Default)]
pub struct ErrorCounter {
    error_count: AtomicU64,
    total_count: AtomicU64,
}

impl ErrorCounter {
    fn reset(&self) {
        self.error_count.store(0, Ordering::Release);
        self.total_count.store(0, Ordering::Release);
    }
}

fn stat_for<C: Default + Send + Sync + 'static>(
    rule: &CircuitBreakerRule,
) -> Result<Arc<LeapArray<C>>, FloodgateError> {
    Ok(Arc::new(LeapArray::new(rule.stat_bucket_count(), rule.stat_interval_ms)?))
}

/// Trips when the ratio of slow completions reaches the threshold.
pub struct SlowRtBreaker {
    base: Arc<BreakerState>,
    stat: Arc<LeapArray<SlowRequestCounter>>,
    max_allowed_rt_ms: u64,
    max_slow_request_ratio: f64,
    min_request_amount: u64,
}

impl SlowRtBreaker {
    pub(crate) fn new(rule: Arc<CircuitBreakerRule>) -> Result<Self, FloodgateError> {
        let stat = stat_for(&rule)?;
        Ok(Self::with_stat(rule, stat))
    }

    pub(crate) fn with_stat(
        rule: Arc<CircuitBreakerRule>,
        stat: Arc<LeapArray<SlowRequestCounter>>,
    ) -> Self {
        Self {
            max_allowed_rt_ms: rule.max_allowed_rt_ms,
            max_slow_request_ratio: rule.threshold,
            min_request_amount: rule.min_request_amount,
            base: BreakerState::new(rule),
            stat,
        }
    }

    fn totals(&self) -> (u64, u64) {
        let mut slow = 0;
        let mut total = 0;
        for counter in self.stat.values(crate::clock::now_millis()) {
            slow += counter.slow_count.load(Ordering::Acquire);
            total += counter.total_count.load(Ordering::Acquire);
        }
        (slow, total)
    }

    fn reset_metric(&self) {
        for counter in self.stat.values(crate::clock::now_millis()) {
            counter.reset();
        }
    }
}

impl CircuitBreaker for SlowRtBreaker {
    fn bound_rule(&self) -> &Arc<CircuitBreakerRule> {
        self.base.rule()
    }

    fn current_state(&self) -> State {
        self.base.current_state()
    }

    fn try_pass(&self, ctx: &mut EntryContext) -> bool {
        self.base.try_pass_base(ctx)
    }

    fn on_request_complete(&self, rt_ms: u64, _error: Option<&(dyn std::error::Error + 'static)>) {
        let counter = match self.stat.current_bucket() {
            Ok(counter) => counter,
            Err(e) => {
                if STAT_LOG_THROTTLE.allow() {
                    tracing::error!(error = %e, rule = %self.base.rule(), "failed to fetch breaker counter");
                }
                return;
            }
        };
        let is_slow = rt_ms > self.max_allowed_rt_ms;
        if is_slow {
            counter.slow_count.fetch_add(1, Ordering::AcqRel);
        }
        counter.total_count.fetch_add(1, Ordering::AcqRel);
        let (slow, total) = self.totals();
        let slow_ratio = slow as f64 / total as f64;

        match self.current_state() {
            State::Open => {}
            State::HalfOpen => {
                if is_slow {
                    self.base.from_half_open_to_open(1.0);
                } else {
                    let probes = self.base.add_cur_probe_num();
                    if self.base.probe_number() == 0 || probes >= self.base.probe_number() {
                        self.base.from_half_open_to_closed();
                        self.reset_metric();
                    }
                }
            }
            State::Closed => {
                if total < self.min_request_amount {
                    return;
                }
                if slow_ratio > self.max_slow_request_ratio
                    || float64_equals(slow_ratio, self.max_slow_request_ratio)
                {
                    match self.current_state() {
                        State::Closed => {
                            self.base.from_closed_to_open(slow_ratio);
                        }
                        State::HalfOpen => {
                            self.base.from_half_open_to_open(slow_ratio);
                        }
                        State::Open => {}
                    }
                }
            }
        }
    }

    fn bound_stat(&self) -> Arc<dyn Any + Send + Sync> {
        self.stat.clone()
    }
}

/// Trips when the ratio of errored completions reaches the threshold.
pub struct ErrorRatioBreaker {
    base: Arc<BreakerState>,
    stat: Arc<LeapArray<ErrorCounter>>,
    error_ratio_threshold: f64,
    min_request_amount: u64,
}

impl ErrorRatioBreaker {
    pub(crate) fn new(rule: Arc<CircuitBreakerRule>) -> Result<Self, FloodgateError> {
        let stat = stat_for(&rule)?;
        Ok(Self::with_stat(rule, stat))
    }

    pub(crate) fn with_stat(
        rule: Arc<CircuitBreakerRule>,
        stat: Arc<LeapArray<ErrorCounter>>,
    ) -> Self {
        Self {
            error_ratio_threshold: rule.threshold,
            min_request_amount: rule.min_request_amount,
            base: BreakerState::new(rule),
            stat,
        }
    }

    fn totals(&self) -> (u64, u64) {
        let mut errors = 0;
        let mut total = 0;
        for counter in self.stat.values(crate::clock::now_millis()) {
            errors += counter.error_count.load(Ordering::Acquire);
            total += counter.total_count.load(Ordering::Acquire);
        }
        (errors, total)
    }

    fn reset_metric(&self) {
        for counter in self.stat.values(crate::clock::now_millis()) {
            counter.reset();
        }
    }
}

impl CircuitBreaker for ErrorRatioBreaker {
    fn bound_rule(&self) -> &Arc<CircuitBreakerRule> {
        self.base.rule()
    }

    fn current_state(&self) -> State {
        self.base.current_state()
    }

    fn try_pass(&self, ctx: &mut EntryContext) -> bool {
        self.base.try_pass_base(ctx)
    }

    fn on_request_complete(&self, _rt_ms: u64, error: Option<&(dyn std::error::Error + 'static)>) {
        let counter = match self.stat.current_bucket() {
            Ok(counter) => counter,
            Err(e) => {
                if STAT_LOG_THROTTLE.allow() {
                    tracing::error!(error = %e, rule = %self.base.rule(), "failed to fetch breaker counter");
                }
                return;
            }
        };
        let errored = error.is_some();
        if errored {
            counter.error_count.fetch_add(1, Ordering::AcqRel);
        }
        counter.total_count.fetch_add(1, Ordering::AcqRel);
        let (errors, total) = self.totals();
        let error_ratio = errors as f64 / total as f64;

        match self.current_state() {
            State::Open => {}
            State::HalfOpen => {
                if errored {
                    self.base.from_half_open_to_open(1.0);
                } else {
                    let probes = self.base.add_cur_probe_num();
                    if self.base.probe_number() == 0 || probes >= self.base.probe_number() {
                        self.base.from_half_open_to_closed();
                        self.reset_metric();
                    }
                }
            }
            State::Closed => {
                if total < self.min_request_amount {
                    return;
                }
                if error_ratio > self.error_ratio_threshold
                    || float64_equals(error_ratio, self.error_ratio_threshold)
                {
                    match self.current_state() {
                        State::Closed => {
                            self.base.from_closed_to_open(error_ratio);
                        }
                        State::HalfOpen => {
                            self.base.from_half_open_to_open(error_ratio);
                        }
                        State::Open => {}
                    }
                }
            }
        }
    }

    fn bound_stat(&self) -> Arc<dyn Any + Send + Sync> {
        self.stat.clone()
    }
}

/// Trips when the raw error count reaches the threshold.
pub struct ErrorCountBreaker {
    base: Arc<BreakerState>,
    stat: Arc<LeapArray<ErrorCounter>>,
    error_count_threshold: u64,
    min_request_amount: u64,
}

impl ErrorCountBreaker {
    pub(crate) fn new(rule: Arc<CircuitBreakerRule>) -> Result<Self, FloodgateError> {
        let stat = stat_for(&rule)?;
        Ok(Self::with_stat(rule, stat))
    }

    pub(crate) fn with_stat(
        rule: Arc<CircuitBreakerRule>,
        stat: Arc<LeapArray<ErrorCounter>>,
    ) -> Self {
        Self {
            error_count_threshold: rule.threshold as u64,
            min_request_amount: rule.min_request_amount,
            base: BreakerState::new(rule),
            stat,
        }
    }

    fn totals(&self) -> (u64, u64) {
        let mut errors = 0;
        let mut total = 0;
        for counter in self.stat.values(crate::clock::now_millis()) {
            errors += counter.error_count.load(Ordering::Acquire);
            total += counter.total_count.load(Ordering::Acquire);
        }
        (errors, total)
    }

    fn reset_metric(&self) {
        for counter in self.stat.values(crate::clock::now_millis()) {
            counter.reset();
        }
    }
}

impl CircuitBreaker for ErrorCountBreaker {
    fn bound_rule(&self) -> &Arc<CircuitBreakerRule> {
        self.base.rule()
    }

    fn current_state(&self) -> State {
        self.base.current_state()
    }

    fn try_pass(&self, ctx: &mut EntryContext) -> bool {
        self.base.try_pass_base(ctx)
    }

    fn on_request_complete(&self, _rt_ms: u64, error: Option<&(dyn std::error::Error + 'static)>) {
        let counter = match self.stat.current_bucket() {
            Ok(counter) => counter,
            Err(e) => {
                if STAT_LOG_THROTTLE.allow() {
                    tracing::error!(error = %e, rule = %self.base.rule(), "failed to fetch breaker counter");
                }
                return;
            }
        };
        let errored = error.is_some();
        if errored {
            counter.error_count.fetch_add(1, Ordering::AcqRel);
        }
        counter.total_count.fetch_add(1, Ordering::AcqRel);
        let (errors, total) = self.totals();

        match self.current_state() {
            State::Open => {}
            State::HalfOpen => {
                if errored {
                    self.base.from_half_open_to_open(1.0);
                } else {
                    let probes = self.base.add_cur_probe_num();
                    if self.base.probe_number() == 0 || probes >= self.base.probe_number() {
                        self.base.from_half_open_to_closed();
                        self.reset_metric();
                    }
                }
            }
            State::Closed => {
                if total < self.min_request_amount {
                    return;
                }
                if errors >= self.error_count_threshold {
                    match self.current_state() {
                        State::Closed => {
                            self.base.from_closed_to_open(errors as f64);
                        }
                        State::HalfOpen => {
                            self.base.from_half_open_to_open(errors as f64);
                        }
                        State::Open => {}
                    }
                }
            }
        }
    }

    fn bound_stat(&self) -> Arc<dyn Any + Send + Sync> {
        self.stat.clone()
    }
}
