//! The slot chain: a deterministic per-call pipeline of prepare,
//! rule-check and statistics stages.
//!
//! Every slot invocation is wrapped in a panic barrier. A panicking slot
//! logs, annotates the context error and the chain keeps going — a buggy
//! slot must never turn into an outage, so internal faults fail open.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use futures::FutureExt;

use crate::block::BlockError;
use crate::circuitbreaker::slot::{CircuitBreakerMetricStatSlot, CircuitBreakerSlot};
use crate::clock;
use crate::context::EntryContext;
use crate::error::FloodgateError;
use crate::flow::slot::{FlowSlot, StandaloneStatSlot};
use crate::hotspot::slot::{HotspotConcurrencyStatSlot, HotspotSlot};
use crate::isolation::slot::IsolationSlot;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stat::slot::{LogSlot, ResourceNodePrepareSlot, StatRecorderSlot};
use crate::system::slot::AdaptiveSystemSlot;

/// Outcome of a rule check, and of the chain as a whole.
#[derive(Debug, Clone, Default)]
pub enum Decision {
    /// Admit the call.
    #[default]
    Pass,
    /// Refuse the call with a structured cause.
    Blocked(BlockError),
    /// Admit the call after pacing it for the given duration.
    Wait(Duration),
}

impl Decision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait(_))
    }

    pub fn blocked_cause(&self) -> Option<&BlockError> {
        match self {
            Self::Blocked(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn wait_duration(&self) -> Option<Duration> {
        match self {
            Self::Wait(d) => Some(*d),
            _ => None,
        }
    }
}

/// Initialization stage run before any rule check. Must not fail; panics
/// are contained and execution continues.
pub trait PrepareSlot: Send + Sync {
    fn order(&self) -> u32;
    fn prepare(&self, ctx: &mut EntryContext);
}

/// Rule-based admission check. Returning `None` means "no opinion".
#[async_trait]
pub trait RuleCheckSlot: Send + Sync {
    fn order(&self) -> u32;
    async fn check(&self, ctx: &mut EntryContext) -> Option<Decision>;
}

/// Statistics stage, invoked after the rule checks settle and again at
/// exit for passed calls.
pub trait StatSlot: Send + Sync {
    fn order(&self) -> u32;
    fn on_entry_passed(&self, ctx: &mut EntryContext);
    fn on_entry_blocked(&self, ctx: &mut EntryContext, cause: &BlockError);
    fn on_completed(&self, ctx: &mut EntryContext);
}

/// Ordered pipeline of prepare, rule-check and stat slots.
pub struct SlotChain {
    prepare_slots: Vec<Arc<dyn PrepareSlot>>,
    rule_check_slots: Vec<Arc<dyn RuleCheckSlot>>,
    stat_slots: Vec<Arc<dyn StatSlot>>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for SlotChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotChain {
    pub fn new() -> Self {
        Self {
            prepare_slots: Vec::with_capacity(8),
            rule_check_slots: Vec::with_capacity(8),
            stat_slots: Vec::with_capacity(8),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used for `Decision::Wait` pacing.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Registration is not thread-safe; assemble the chain before sharing.
    pub fn add_prepare_slot(&mut self, slot: Arc<dyn PrepareSlot>) {
        self.prepare_slots.push(slot);
        self.prepare_slots.sort_by_key(|s| s.order());
    }

    pub fn add_rule_check_slot(&mut self, slot: Arc<dyn RuleCheckSlot>) {
        self.rule_check_slots.push(slot);
        self.rule_check_slots.sort_by_key(|s| s.order());
    }

    pub fn add_stat_slot(&mut self, slot: Arc<dyn StatSlot>) {
        self.stat_slots.push(slot);
        self.stat_slots.sort_by_key(|s| s.order());
    }

    pub(crate) fn get_pooled_context(&self) -> Box<EntryContext> {
        let mut ctx = ctx_pool().pop().unwrap_or_default();
        ctx.start_time = clock::now_millis();
        ctx
    }

    pub(crate) fn refurbish_context(&self, mut ctx: Box<EntryContext>) {
        ctx.reset();
        ctx_pool().push(ctx);
    }

    pub(crate) async fn run_entry(&self, ctx: &mut EntryContext) -> Decision {
        for slot in &self.prepare_slots {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| slot.prepare(ctx))) {
                contain_panic(ctx, "prepare", slot.order(), payload);
            }
        }

        let mut blocked = None;
        for slot in &self.rule_check_slots {
            let outcome = AssertUnwindSafe(slot.check(ctx)).catch_unwind().await;
            match outcome {
                Err(payload) => contain_panic(ctx, "rule-check", slot.order(), payload),
                Ok(None) | Ok(Some(Decision::Pass)) => {}
                Ok(Some(Decision::Wait(d))) => self.sleeper.sleep(d).await,
                Ok(Some(Decision::Blocked(cause))) => {
                    blocked = Some(Decision::Blocked(cause));
                    break;
                }
            }
        }
        ctx.decision = blocked.unwrap_or(Decision::Pass);

        let decision = ctx.decision.clone();
        for slot in &self.stat_slots {
            let outcome = match &decision {
                Decision::Blocked(cause) => {
                    catch_unwind(AssertUnwindSafe(|| slot.on_entry_blocked(ctx, cause)))
                }
                _ => catch_unwind(AssertUnwindSafe(|| slot.on_entry_passed(ctx))),
            };
            if let Err(payload) = outcome {
                contain_panic(ctx, "stat", slot.order(), payload);
            }
        }
        decision
    }

    /// Completion pass. Blocked calls skip it entirely.
    pub(crate) fn run_exit(&self, ctx: &mut EntryContext) {
        if ctx.is_blocked() {
            return;
        }
        for slot in &self.stat_slots {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| slot.on_completed(ctx))) {
                contain_panic(ctx, "stat-exit", slot.order(), payload);
            }
        }
    }
}

fn contain_panic(
    ctx: &mut EntryContext,
    stage: &str,
    order: u32,
    payload: Box<dyn std::any::Any + Send>,
) {
    let message = panic_message(payload);
    tracing::error!(stage, order, panic = %message, "slot panicked; failing open");
    ctx.set_error(Arc::new(FloodgateError::InternalPanic { message }));
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

static CTX_POOL: OnceLock<SegQueue<Box<EntryContext>>> = OnceLock::new();

fn ctx_pool() -> &'static SegQueue<Box<EntryContext>> {
    CTX_POOL.get_or_init(SegQueue::new)
}

static GLOBAL_SLOT_CHAIN: OnceLock<Arc<SlotChain>> = OnceLock::new();

/// The process-wide default chain with every built-in slot registered.
pub fn global_slot_chain() -> Arc<SlotChain> {
    GLOBAL_SLOT_CHAIN.get_or_init(|| Arc::new(build_default_slot_chain())).clone()
}

/// Assemble a chain with the default slot set:
///
/// - prepare: resource-node prepare (1000)
/// - rule check: system (1000), flow (2000), isolation (3000),
///   hot-spot (4000), circuit breaker (5000)
/// - stat: recorder (0), log (900), flow standalone (1000),
///   hot-spot concurrency (4000), circuit-breaker completion (5000)
pub fn build_default_slot_chain() -> SlotChain {
    let mut sc = SlotChain::new();
    sc.add_prepare_slot(Arc::new(ResourceNodePrepareSlot));

    sc.add_rule_check_slot(Arc::new(AdaptiveSystemSlot));
    sc.add_rule_check_slot(Arc::new(FlowSlot::default()));
    sc.add_rule_check_slot(Arc::new(IsolationSlot));
    sc.add_rule_check_slot(Arc::new(HotspotSlot::default()));
    sc.add_rule_check_slot(Arc::new(CircuitBreakerSlot));

    sc.add_stat_slot(Arc::new(StatRecorderSlot));
    sc.add_stat_slot(Arc::new(LogSlot));
    sc.add_stat_slot(Arc::new(StandaloneStatSlot));
    sc.add_stat_slot(Arc::new(HotspotConcurrencyStatSlot));
    sc.add_stat_slot(Arc::new(CircuitBreakerMetricStatSlot));
    sc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSlot {
        order: u32,
        log: Arc<std::sync::Mutex<Vec<u32>>>,
    }

    impl PrepareSlot for RecordingSlot {
        fn order(&self) -> u32 {
            self.order
        }
        fn prepare(&self, _ctx: &mut EntryContext) {
            self.log.lock().unwrap().push(self.order);
        }
    }

    struct PanickingCheckSlot;

    #[async_trait]
    impl RuleCheckSlot for PanickingCheckSlot {
        fn order(&self) -> u32 {
            1
        }
        async fn check(&self, _ctx: &mut EntryContext) -> Option<Decision> {
            panic!("buggy slot");
        }
    }

    struct BlockingCheckSlot {
        order: u32,
        hits: Arc<AtomicUsize>,
        block: bool,
    }

    #[async_trait]
    impl RuleCheckSlot for BlockingCheckSlot {
        fn order(&self) -> u32 {
            self.order
        }
        async fn check(&self, _ctx: &mut EntryContext) -> Option<Decision> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.block {
                Some(Decision::Blocked(BlockError::new(crate::block::BlockType::Flow)))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn slots_run_in_declared_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut sc = SlotChain::new();
        sc.add_prepare_slot(Arc::new(RecordingSlot { order: 2000, log: log.clone() }));
        sc.add_prepare_slot(Arc::new(RecordingSlot { order: 1000, log: log.clone() }));
        sc.add_prepare_slot(Arc::new(RecordingSlot { order: 3000, log: log.clone() }));
        let mut ctx = EntryContext::default();
        sc.run_entry(&mut ctx).await;
        assert_eq!(*log.lock().unwrap(), vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn panicking_check_fails_open() {
        let mut sc = SlotChain::new();
        sc.add_rule_check_slot(Arc::new(PanickingCheckSlot));
        let mut ctx = EntryContext::default();
        let decision = sc.run_entry(&mut ctx).await;
        assert!(decision.is_pass());
        let err = ctx.error().expect("panic should annotate the context");
        assert!(err.to_string().contains("buggy slot"));
    }

    #[tokio::test]
    async fn first_block_short_circuits_remaining_checks() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut sc = SlotChain::new();
        sc.add_rule_check_slot(Arc::new(BlockingCheckSlot {
            order: 1,
            hits: first.clone(),
            block: true,
        }));
        sc.add_rule_check_slot(Arc::new(BlockingCheckSlot {
            order: 2,
            hits: second.clone(),
            block: false,
        }));
        let mut ctx = EntryContext::default();
        let decision = sc.run_entry(&mut ctx).await;
        assert!(decision.is_blocked());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exit_skips_completion_for_blocked_calls() {
        struct CompletionCounter {
            completions: Arc<AtomicUsize>,
        }
        impl StatSlot for CompletionCounter {
            fn order(&self) -> u32 {
                0
            }
            fn on_entry_passed(&self, _ctx: &mut EntryContext) {}
            fn on_entry_blocked(&self, _ctx: &mut EntryContext, _cause: &BlockError) {}
            fn on_completed(&self, _ctx: &mut EntryContext) {
                self.completions.fetch_add(1, Ordering::SeqCst);
            }
        }

        let completions = Arc::new(AtomicUsize::new(0));
        let mut sc = SlotChain::new();
        sc.add_rule_check_slot(Arc::new(BlockingCheckSlot {
            order: 1,
            hits: Arc::new(AtomicUsize::new(0)),
            block: true,
        }));
        sc.add_stat_slot(Arc::new(CompletionCounter { completions: completions.clone() }));
        let mut ctx = EntryContext::default();
        sc.run_entry(&mut ctx).await;
        sc.run_exit(&mut ctx);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pooled_contexts_are_reset() {
        let sc = SlotChain::new();
        let mut ctx = sc.get_pooled_context();
        ctx.input.batch_count = 9;
        sc.refurbish_context(ctx);
        let ctx = sc.get_pooled_context();
        assert_eq!(ctx.input.batch_count, 1);
        assert!(ctx.start_time() > 0);
    }
}
