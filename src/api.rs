//! Caller-facing gate: `entry()` and its options.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::BlockError;
use crate::chain::{global_slot_chain, Decision, SlotChain};
use crate::context::ParamValue;
use crate::entry::Entry;
use crate::resource::{ResourceType, ResourceWrapper, TrafficType};

/// Options for one gated call. Defaults: common resource type, outbound
/// traffic, batch count 1.
#[derive(Default)]
pub struct EntryOptions {
    resource_type: ResourceType,
    traffic_type: TrafficType,
    batch_count: Option<u32>,
    flag: i32,
    args: Vec<ParamValue>,
    attachments: HashMap<String, ParamValue>,
    slot_chain: Option<Arc<SlotChain>>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    /// Number of abstract tokens this call consumes (default 1).
    pub fn with_batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = Some(batch_count);
        self
    }

    pub fn with_flag(mut self, flag: i32) -> Self {
        self.flag = flag;
        self
    }

    /// Positional call arguments, consulted by hot-spot rules.
    pub fn with_args(mut self, args: impl IntoIterator<Item = ParamValue>) -> Self {
        self.args.extend(args);
        self
    }

    /// Keyed attachments; a hot-spot rule's `param_key` takes these over
    /// positional arguments.
    pub fn with_attachment(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.attachments.insert(key.into(), value);
        self
    }

    /// Run this call through a custom chain instead of the global one.
    pub fn with_slot_chain(mut self, chain: Arc<SlotChain>) -> Self {
        self.slot_chain = Some(chain);
        self
    }
}

/// Gate a call on `resource` with default options.
///
/// Returns the exit handle on pass, or the structured refusal on block.
pub async fn entry(resource: &str) -> Result<Entry, BlockError> {
    entry_with_opts(resource, EntryOptions::default()).await
}

/// Gate a call on `resource`.
pub async fn entry_with_opts(resource: &str, opts: EntryOptions) -> Result<Entry, BlockError> {
    let chain = opts.slot_chain.unwrap_or_else(global_slot_chain);
    let res = Arc::new(ResourceWrapper::new(
        resource.to_string(),
        opts.resource_type,
        opts.traffic_type,
    ));

    let mut ctx = chain.get_pooled_context();
    ctx.resource = res.clone();
    ctx.input.batch_count = opts.batch_count.unwrap_or(1);
    ctx.input.flag = opts.flag;
    ctx.input.args = opts.args;
    ctx.input.attachments = opts.attachments;

    let decision = chain.run_entry(&mut ctx).await;
    let mut entry = Entry::new(ctx, res, chain);
    match decision {
        Decision::Blocked(cause) => {
            // Exit immediately so hooks run and the context returns to
            // the pool; the caller only sees the refusal.
            entry.exit();
            Err(cause)
        }
        _ => Ok(entry),
    }
}

/// Record a business error against an entry before it exits.
pub fn trace_error(entry: &mut Entry, err: Arc<dyn std::error::Error + Send + Sync>) {
    entry.set_error(err);
}
