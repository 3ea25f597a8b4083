//! Per-call scratch state shared by every slot in the chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chain::Decision;
use crate::clock;
use crate::resource::ResourceWrapper;
use crate::stat::node::ResourceNode;

/// Dynamically typed call argument or attachment value.
///
/// Hot-spot rules key their counters by these, so the type is hashable and
/// cheap to compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
            Self::Bytes(v) => write!(f, "bytes[{}]", v.len()),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Caller-supplied input of one gated call.
#[derive(Debug)]
pub struct EntryInput {
    pub batch_count: u32,
    pub flag: i32,
    pub args: Vec<ParamValue>,
    pub attachments: HashMap<String, ParamValue>,
}

impl Default for EntryInput {
    fn default() -> Self {
        Self { batch_count: 1, flag: 0, args: Vec::new(), attachments: HashMap::new() }
    }
}

impl EntryInput {
    fn reset(&mut self) {
        self.batch_count = 1;
        self.flag = 0;
        self.args.clear();
        self.attachments.clear();
    }
}

pub(crate) type ExitHook = Box<dyn FnOnce(&mut EntryContext) + Send + 'static>;

/// Pooled per-call context: timestamps, input, the rule-check outcome, the
/// business error and the exit hooks registered along the way.
pub struct EntryContext {
    pub(crate) start_time: u64,
    pub(crate) rt: u64,
    pub resource: Arc<ResourceWrapper>,
    pub stat_node: Option<Arc<ResourceNode>>,
    pub input: EntryInput,
    pub(crate) decision: Decision,
    err: Option<Arc<dyn std::error::Error + Send + Sync>>,
    pub(crate) exit_hooks: Vec<ExitHook>,
}

impl Default for EntryContext {
    fn default() -> Self {
        Self {
            start_time: 0,
            rt: 0,
            resource: Arc::new(ResourceWrapper::default()),
            stat_node: None,
            input: EntryInput::default(),
            decision: Decision::Pass,
            err: None,
            exit_hooks: Vec::new(),
        }
    }
}

impl EntryContext {
    /// Unix millisecond at which the call entered the gate.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Round-trip time of the call. Falls back to "now minus start" when
    /// no explicit measurement was recorded yet.
    pub fn round_trip_ms(&self) -> u64 {
        if self.rt == 0 {
            return clock::now_millis().saturating_sub(self.start_time);
        }
        self.rt
    }

    pub(crate) fn put_rt(&mut self, rt: u64) {
        self.rt = rt;
    }

    /// Outcome of the rule-check stage.
    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn is_blocked(&self) -> bool {
        self.decision.is_blocked()
    }

    pub fn error(&self) -> Option<&Arc<dyn std::error::Error + Send + Sync>> {
        self.err.as_ref()
    }

    pub fn set_error(&mut self, err: Arc<dyn std::error::Error + Send + Sync>) {
        self.err = Some(err);
    }

    /// Register a hook run during exit, before stat completion.
    pub fn when_exit(&mut self, hook: impl FnOnce(&mut EntryContext) + Send + 'static) {
        self.exit_hooks.push(Box::new(hook));
    }

    /// Clear all per-call state so the context can return to the pool.
    pub(crate) fn reset(&mut self) {
        self.start_time = 0;
        self.rt = 0;
        self.resource = Arc::new(ResourceWrapper::default());
        self.stat_node = None;
        self.input.reset();
        self.decision = Decision::Pass;
        self.err = None;
        self.exit_hooks.clear();
    }
}
