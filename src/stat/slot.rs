//! Built-in prepare and statistics slots.

use crate::block::BlockError;
use crate::chain::{PrepareSlot, StatSlot};
use crate::clock;
use crate::context::EntryContext;
use crate::resource::TrafficType;
use crate::stat::node::{get_or_create_resource_node, inbound_node, ResourceNode};
use crate::stat::{MetricEvent, WriteStat};

pub(crate) const PREPARE_SLOT_ORDER: u32 = 1000;
pub(crate) const STAT_SLOT_ORDER: u32 = 0;
pub(crate) const LOG_SLOT_ORDER: u32 = 900;

/// Attaches the resource's stat node to the context before any check runs.
pub struct ResourceNodePrepareSlot;

impl PrepareSlot for ResourceNodePrepareSlot {
    fn order(&self) -> u32 {
        PREPARE_SLOT_ORDER
    }

    fn prepare(&self, ctx: &mut EntryContext) {
        let node = get_or_create_resource_node(ctx.resource.name(), ctx.resource.classification());
        ctx.stat_node = Some(node);
    }
}

/// Records pass/block on entry and RT/complete/error on exit, keeping the
/// concurrency counter balanced. Inbound traffic is mirrored into the
/// inbound aggregate node.
pub struct StatRecorderSlot;

impl StatRecorderSlot {
    fn record_pass(node: &ResourceNode, count: u32) {
        node.increase_concurrency();
        node.add_count(MetricEvent::Pass, i64::from(count));
    }

    fn record_block(node: &ResourceNode, count: u32) {
        node.add_count(MetricEvent::Block, i64::from(count));
    }

    fn record_complete(node: &ResourceNode, count: u32, rt: u64, errored: bool) {
        node.add_count(MetricEvent::Rt, rt as i64);
        node.add_count(MetricEvent::Complete, i64::from(count));
        if errored {
            node.add_count(MetricEvent::Error, i64::from(count));
        }
        node.decrease_concurrency();
    }
}

impl StatSlot for StatRecorderSlot {
    fn order(&self) -> u32 {
        STAT_SLOT_ORDER
    }

    fn on_entry_passed(&self, ctx: &mut EntryContext) {
        let count = ctx.input.batch_count;
        if let Some(node) = ctx.stat_node.clone() {
            Self::record_pass(&node, count);
        }
        if ctx.resource.flow_type() == TrafficType::Inbound {
            Self::record_pass(inbound_node(), count);
        }
    }

    fn on_entry_blocked(&self, ctx: &mut EntryContext, _cause: &BlockError) {
        let count = ctx.input.batch_count;
        if let Some(node) = ctx.stat_node.clone() {
            Self::record_block(&node, count);
        }
        if ctx.resource.flow_type() == TrafficType::Inbound {
            Self::record_block(inbound_node(), count);
        }
    }

    fn on_completed(&self, ctx: &mut EntryContext) {
        let rt = clock::now_millis().saturating_sub(ctx.start_time());
        ctx.put_rt(rt);
        let count = ctx.input.batch_count;
        let errored = ctx.error().is_some();
        if let Some(node) = ctx.stat_node.clone() {
            Self::record_complete(&node, count, rt, errored);
        }
        if ctx.resource.flow_type() == TrafficType::Inbound {
            Self::record_complete(inbound_node(), count, rt, errored);
        }
    }
}

/// Emits a debug line per refusal, for local diagnosis.
pub struct LogSlot;

impl StatSlot for LogSlot {
    fn order(&self) -> u32 {
        LOG_SLOT_ORDER
    }

    fn on_entry_passed(&self, _ctx: &mut EntryContext) {}

    fn on_entry_blocked(&self, ctx: &mut EntryContext, cause: &BlockError) {
        tracing::debug!(
            resource = ctx.resource.name(),
            block_type = %cause.block_type(),
            msg = cause.block_msg(),
            "request blocked"
        );
    }

    fn on_completed(&self, _ctx: &mut EntryContext) {}
}
