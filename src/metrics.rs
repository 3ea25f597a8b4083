//! Per-second metric records and their line-oriented text codec.
//!
//! File rotation and flushing belong to the host; this module produces the
//! records and the wire form those collaborators consume.

use std::fmt;

use crate::stat::node::{inbound_node, resource_node_list, ResourceNode};

/// One resource-second of aggregated metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricItem {
    pub timestamp_ms: u64,
    pub resource: String,
    pub classification: i32,
    pub pass_qps: u64,
    pub block_qps: u64,
    pub complete_qps: u64,
    pub error_qps: u64,
    pub avg_rt: u64,
    pub concurrency: u32,
}

/// A metric log line failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLineError(String);

impl fmt::Display for MetricLineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid metric line: {}", self.0)
    }
}

impl std::error::Error for MetricLineError {}

impl MetricItem {
    /// Encode as one pipe-separated log line:
    /// `timestamp_ms|resource|classification|pass|block|complete|error|avg_rt|concurrency`.
    pub fn format_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.timestamp_ms,
            self.resource,
            self.classification,
            self.pass_qps,
            self.block_qps,
            self.complete_qps,
            self.error_qps,
            self.avg_rt,
            self.concurrency
        )
    }

    /// Decode a line produced by [`MetricItem::format_line`].
    pub fn parse_line(line: &str) -> Result<Self, MetricLineError> {
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() != 9 {
            return Err(MetricLineError(format!("expected 9 fields, got {}", fields.len())));
        }
        let num = |idx: usize| -> Result<u64, MetricLineError> {
            fields[idx]
                .parse::<u64>()
                .map_err(|_| MetricLineError(format!("field {} is not numeric: {}", idx, fields[idx])))
        };
        Ok(Self {
            timestamp_ms: num(0)?,
            resource: fields[1].to_string(),
            classification: fields[2]
                .parse::<i32>()
                .map_err(|_| MetricLineError(format!("bad classification: {}", fields[2])))?,
            pass_qps: num(3)?,
            block_qps: num(4)?,
            complete_qps: num(5)?,
            error_qps: num(6)?,
            avg_rt: num(7)?,
            concurrency: num(8)? as u32,
        })
    }
}

/// Per-second items of one node, for seconds strictly before
/// `current_second_start`, stamped with the node's identity.
pub fn current_metric_items(node: &ResourceNode, current_second_start: u64) -> Vec<MetricItem> {
    let mut items = node
        .default_metric()
        .second_metrics_on_condition(|ts| ts < current_second_start);
    for item in &mut items {
        item.resource = node.resource_name().to_string();
        item.classification = node.resource_type() as i32;
    }
    items
}

/// Aggregate the finished seconds of every registered resource node plus
/// the inbound aggregate node, sorted by timestamp then resource.
pub fn aggregate_current_items(current_time_ms: u64) -> Vec<MetricItem> {
    let current_second_start = current_time_ms - current_time_ms % 1000;
    let mut items = Vec::new();
    for node in resource_node_list() {
        items.extend(current_metric_items(&node, current_second_start));
    }
    items.extend(current_metric_items(inbound_node(), current_second_start));
    items.sort_by(|a, b| {
        a.timestamp_ms.cmp(&b.timestamp_ms).then_with(|| a.resource.cmp(&b.resource))
    });
    items
}
