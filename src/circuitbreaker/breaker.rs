//! Circuit breaker state machine shared by all strategies.
//!
//! ```text
//!                                switch to open based on rule
//!             +---------------------------------------------------+
//!             |                                                   v
//!     +--------------+      probe succeed   +------------+    +--------+
//!     |              |<---------------------|            |<---|        |
//!     |    Closed    |                      |  HalfOpen  |    |  Open  |
//!     |              |     probe failed     |            |    |        |
//!     +--------------+                      |            |--->|        |
//!                                           +------------+    +--------+
//! ```
//!
//! Transitions are single compare-and-swaps on the state atomic; the only
//! legal moves are Closed→Open, Open→HalfOpen, HalfOpen→Open and
//! HalfOpen→Closed.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::chain::panic_message;
use crate::circuitbreaker::rule::CircuitBreakerRule;
use crate::clock;
use crate::context::EntryContext;

const STATE_CLOSED: u8 = 0;
const STATE_HALF_OPEN: u8 = 1;
const STATE_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    HalfOpen,
    Open,
}

impl State {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_HALF_OPEN => Self::HalfOpen,
            STATE_OPEN => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::HalfOpen => write!(f, "HalfOpen"),
            Self::Open => write!(f, "Open"),
        }
    }
}

/// Observer of breaker state transitions. Notifications are best-effort
/// and must not block.
pub trait StateChangeListener: Send + Sync {
    fn on_transform_to_closed(&self, prev: State, rule: &CircuitBreakerRule);
    fn on_transform_to_open(&self, prev: State, rule: &CircuitBreakerRule, snapshot: Option<f64>);
    fn on_transform_to_half_open(&self, prev: State, rule: &CircuitBreakerRule);
}

static LISTENERS: OnceLock<RwLock<Vec<Arc<dyn StateChangeListener>>>> = OnceLock::new();

fn listeners() -> &'static RwLock<Vec<Arc<dyn StateChangeListener>>> {
    LISTENERS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Append listeners to the global notification list.
pub fn register_state_change_listeners(new_listeners: Vec<Arc<dyn StateChangeListener>>) {
    listeners().write().extend(new_listeners);
}

pub fn clear_state_change_listeners() {
    listeners().write().clear();
}

fn snapshot_listeners() -> Vec<Arc<dyn StateChangeListener>> {
    listeners().read().clone()
}

fn guard_listener(call: impl FnOnce() + std::panic::UnwindSafe) {
    if let Err(payload) = catch_unwind(call) {
        tracing::error!(panic = %panic_message(payload), "state-change listener panicked");
    }
}

/// Behaviour common to every breaker strategy.
pub trait CircuitBreaker: Send + Sync {
    fn bound_rule(&self) -> &Arc<CircuitBreakerRule>;
    fn current_state(&self) -> State;
    /// Admission check against the state machine. May transition
    /// Open→HalfOpen and arm the probe rollback hook on `ctx`.
    fn try_pass(&self, ctx: &mut EntryContext) -> bool;
    /// Record one completed request and drive state transitions.
    /// Called only for passed calls, at exit.
    fn on_request_complete(&self, rt_ms: u64, error: Option<&(dyn std::error::Error + 'static)>);
    /// The strategy's private statistic, for shape-compatible reuse.
    fn bound_stat(&self) -> Arc<dyn Any + Send + Sync>;
}

/// Shared core: rule binding, retry bookkeeping, probe counting and the
/// CAS transition table.
pub(crate) struct BreakerState {
    rule: Arc<CircuitBreakerRule>,
    retry_timeout_ms: u32,
    next_retry_timestamp_ms: AtomicU64,
    probe_number: u64,
    cur_probe_number: AtomicU64,
    state: AtomicU8,
}

impl BreakerState {
    pub(crate) fn new(rule: Arc<CircuitBreakerRule>) -> Arc<Self> {
        Arc::new(Self {
            retry_timeout_ms: rule.retry_timeout_ms,
            probe_number: rule.probe_num,
            next_retry_timestamp_ms: AtomicU64::new(0),
            cur_probe_number: AtomicU64::new(0),
            state: AtomicU8::new(STATE_CLOSED),
            rule,
        })
    }

    pub(crate) fn rule(&self) -> &Arc<CircuitBreakerRule> {
        &self.rule
    }

    pub(crate) fn probe_number(&self) -> u64 {
        self.probe_number
    }

    pub(crate) fn current_state(&self) -> State {
        State::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn retry_timeout_arrived(&self) -> bool {
        clock::now_millis() >= self.next_retry_timestamp_ms.load(Ordering::Acquire)
    }

    fn update_next_retry_timestamp(&self) {
        self.next_retry_timestamp_ms
            .store(clock::now_millis() + u64::from(self.retry_timeout_ms), Ordering::Release);
    }

    pub(crate) fn add_cur_probe_num(&self) -> u64 {
        self.cur_probe_number.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn reset_cur_probe_num(&self) {
        self.cur_probe_number.store(0, Ordering::Release);
    }

    /// Admission decision shared by every strategy.
    pub(crate) fn try_pass_base(self: &Arc<Self>, ctx: &mut EntryContext) -> bool {
        match self.current_state() {
            State::Closed => true,
            State::Open => self.retry_timeout_arrived() && self.from_open_to_half_open(ctx),
            State::HalfOpen => self.probe_number > 0,
        }
    }

    /// Closed→Open. True iff this caller won the transition.
    pub(crate) fn from_closed_to_open(&self, snapshot: f64) -> bool {
        if self
            .state
            .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.update_next_retry_timestamp();
            for listener in snapshot_listeners() {
                guard_listener(AssertUnwindSafe(|| {
                    listener.on_transform_to_open(State::Closed, &self.rule, Some(snapshot))
                }));
            }
            tracing::info!(rule = %self.rule, snapshot, "circuit breaker Closed -> Open");
            return true;
        }
        false
    }

    /// Open→HalfOpen. On success the probe entry gets an exit hook that
    /// rolls the machine back to Open if that entry ends up blocked by a
    /// later check, so a refused probe cannot leave the breaker half-open
    /// without a completion callback.
    pub(crate) fn from_open_to_half_open(self: &Arc<Self>, ctx: &mut EntryContext) -> bool {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            for listener in snapshot_listeners() {
                guard_listener(AssertUnwindSafe(|| {
                    listener.on_transform_to_half_open(State::Open, &self.rule)
                }));
            }
            let state = self.clone();
            ctx.when_exit(move |ctx| {
                if ctx.is_blocked()
                    && state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    for listener in snapshot_listeners() {
                        guard_listener(AssertUnwindSafe(|| {
                            listener.on_transform_to_open(State::HalfOpen, &state.rule, Some(1.0))
                        }));
                    }
                }
            });
            tracing::info!(rule = %self.rule, "circuit breaker Open -> HalfOpen");
            return true;
        }
        false
    }

    /// HalfOpen→Open. True iff this caller won the transition.
    pub(crate) fn from_half_open_to_open(&self, snapshot: f64) -> bool {
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reset_cur_probe_num();
            self.update_next_retry_timestamp();
            for listener in snapshot_listeners() {
                guard_listener(AssertUnwindSafe(|| {
                    listener.on_transform_to_open(State::HalfOpen, &self.rule, Some(snapshot))
                }));
            }
            tracing::warn!(rule = %self.rule, "circuit breaker HalfOpen -> Open");
            return true;
        }
        false
    }

    /// HalfOpen→Closed. True iff this caller won the transition.
    pub(crate) fn from_half_open_to_closed(&self) -> bool {
        if self
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reset_cur_probe_num();
            for listener in snapshot_listeners() {
                guard_listener(AssertUnwindSafe(|| {
                    listener.on_transform_to_closed(State::HalfOpen, &self.rule)
                }));
            }
            tracing::info!(rule = %self.rule, "circuit breaker HalfOpen -> Closed");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn state_for_test() -> Arc<BreakerState> {
        BreakerState::new(Arc::new(CircuitBreakerRule {
            resource: "breaker_core_test".into(),
            retry_timeout_ms: 50,
            stat_interval_ms: 1000,
            probe_num: 1,
            ..Default::default()
        }))
    }

    struct RecordingListener {
        transitions: Mutex<Vec<(State, State)>>,
    }

    impl StateChangeListener for RecordingListener {
        fn on_transform_to_closed(&self, prev: State, _rule: &CircuitBreakerRule) {
            self.transitions.lock().unwrap().push((prev, State::Closed));
        }
        fn on_transform_to_open(
            &self,
            prev: State,
            _rule: &CircuitBreakerRule,
            _snapshot: Option<f64>,
        ) {
            self.transitions.lock().unwrap().push((prev, State::Open));
        }
        fn on_transform_to_half_open(&self, prev: State, _rule: &CircuitBreakerRule) {
            self.transitions.lock().unwrap().push((prev, State::HalfOpen));
        }
    }

    #[test]
    fn only_legal_transitions_win() {
        let state = state_for_test();
        assert_eq!(state.current_state(), State::Closed);
        // HalfOpen moves require a half-open machine.
        assert!(!state.from_half_open_to_open(1.0));
        assert!(!state.from_half_open_to_closed());
        assert!(state.from_closed_to_open(0.9));
        assert!(!state.from_closed_to_open(0.9), "second CAS must lose");
        assert_eq!(state.current_state(), State::Open);
    }

    #[test]
    fn open_waits_for_the_retry_timeout() {
        let state = state_for_test();
        let mut ctx = EntryContext::default();
        assert!(state.from_closed_to_open(1.0));
        // Fresh open: the retry timestamp is in the future.
        assert!(!state.try_pass_base(&mut ctx));
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(state.try_pass_base(&mut ctx));
        assert_eq!(state.current_state(), State::HalfOpen);
    }

    #[test]
    fn probe_rollback_hook_fires_on_blocked_entry() {
        let state = state_for_test();
        let mut ctx = EntryContext::default();
        assert!(state.from_closed_to_open(1.0));
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(state.try_pass_base(&mut ctx));
        assert_eq!(state.current_state(), State::HalfOpen);

        // The probe entry ends up blocked by a later slot.
        ctx.decision = crate::chain::Decision::Blocked(crate::block::BlockError::new(
            crate::block::BlockType::CircuitBreaking,
        ));
        let hooks = std::mem::take(&mut ctx.exit_hooks);
        assert_eq!(hooks.len(), 1);
        for hook in hooks {
            hook(&mut ctx);
        }
        assert_eq!(state.current_state(), State::Open);
    }

    #[test]
    fn listeners_observe_transitions_and_panics_are_contained() {
        let _guard = crate::util::TEST_RULES_LOCK.lock();
        struct PanickingListener(AtomicUsize);
        impl StateChangeListener for PanickingListener {
            fn on_transform_to_closed(&self, _: State, _: &CircuitBreakerRule) {}
            fn on_transform_to_open(&self, _: State, _: &CircuitBreakerRule, _: Option<f64>) {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("listener bug");
            }
            fn on_transform_to_half_open(&self, _: State, _: &CircuitBreakerRule) {}
        }

        let recorder = Arc::new(RecordingListener { transitions: Mutex::new(Vec::new()) });
        register_state_change_listeners(vec![
            Arc::new(PanickingListener(AtomicUsize::new(0))),
            recorder.clone(),
        ]);

        let state = state_for_test();
        assert!(state.from_closed_to_open(0.5));
        let seen = recorder.transitions.lock().unwrap().clone();
        assert_eq!(seen, vec![(State::Closed, State::Open)]);
        clear_state_change_listeners();
    }
}
