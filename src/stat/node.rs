//! Per-resource statistic nodes and the process-wide registry.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::config::{
    self, DEFAULT_INTERVAL_MS, DEFAULT_INTERVAL_MS_TOTAL, DEFAULT_MAX_RESOURCE_AMOUNT,
    DEFAULT_SAMPLE_COUNT, DEFAULT_SAMPLE_COUNT_TOTAL, TOTAL_INBOUND_RESOURCE_NAME,
};
use crate::error::FloodgateError;
use crate::resource::ResourceType;
use crate::stat::metric_bucket::MetricLeapArray;
use crate::stat::sliding_window::SlidingWindowMetric;
use crate::stat::{MetricEvent, ReadStat, WriteStat};

/// Real-time statistics holder for one resource: a wide global leap array,
/// the default read-only window derived from it, and the live concurrency
/// counter.
pub struct ResourceNode {
    resource_name: String,
    resource_type: ResourceType,
    global: Arc<MetricLeapArray>,
    default_metric: Arc<SlidingWindowMetric>,
    concurrency: AtomicI32,
}

impl ResourceNode {
    /// Create a node shaped by the current configuration.
    pub fn new(resource_name: String, resource_type: ResourceType) -> Self {
        let configured = Self::build_statistic(
            (
                config::global_statistic_sample_count_total(),
                config::global_statistic_interval_ms_total(),
            ),
            (config::metric_statistic_sample_count(), config::metric_statistic_interval_ms()),
        );
        let (global, default_metric) = configured.unwrap_or_else(|e| {
            tracing::warn!(error = %e, resource = %resource_name,
                "invalid statistic configuration, using default shape");
            Self::build_statistic(
                (DEFAULT_SAMPLE_COUNT_TOTAL, DEFAULT_INTERVAL_MS_TOTAL),
                (DEFAULT_SAMPLE_COUNT, DEFAULT_INTERVAL_MS),
            )
            .expect("default statistic shape is valid")
        });
        Self {
            resource_name,
            resource_type,
            global,
            default_metric,
            concurrency: AtomicI32::new(0),
        }
    }

    fn build_statistic(
        global_shape: (u32, u32),
        metric_shape: (u32, u32),
    ) -> Result<(Arc<MetricLeapArray>, Arc<SlidingWindowMetric>), FloodgateError> {
        let global = Arc::new(MetricLeapArray::new(global_shape.0, global_shape.1)?);
        let window =
            Arc::new(SlidingWindowMetric::new(metric_shape.0, metric_shape.1, global.clone())?);
        Ok((global, window))
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// The default read-only window (metric resolution).
    pub fn default_metric(&self) -> &Arc<SlidingWindowMetric> {
        &self.default_metric
    }

    /// Derive a read-only window at another compatible resolution over the
    /// same global array.
    pub fn generate_read_stat(
        &self,
        sample_count: u32,
        interval_ms: u32,
    ) -> Result<SlidingWindowMetric, FloodgateError> {
        SlidingWindowMetric::new(sample_count, interval_ms, self.global.clone())
    }

    pub(crate) fn global_sample_count(&self) -> u32 {
        self.global.sample_count()
    }

    pub(crate) fn global_interval_ms(&self) -> u32 {
        self.global.interval_ms()
    }

    /// Peak per-second rate estimate of `event` over the default window.
    pub fn max_avg(&self, event: MetricEvent) -> f64 {
        self.default_metric.max_avg(event)
    }

    pub fn current_concurrency(&self) -> i32 {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn increase_concurrency(&self) {
        let cur = self.concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        self.global.update_concurrency(cur);
    }

    /// Decrement, clamping at zero. Going negative means an exit was
    /// accounted without a matching pass; log it and recover.
    pub fn decrease_concurrency(&self) {
        let cur = self.concurrency.fetch_sub(1, Ordering::AcqRel) - 1;
        if cur < 0 {
            tracing::error!(
                resource = %self.resource_name,
                concurrency = cur,
                "negative concurrency, clamping to zero"
            );
            self.concurrency.store(0, Ordering::Release);
        }
    }

    /// Maximum concurrency observed in the default window.
    pub fn max_concurrency(&self) -> i32 {
        self.default_metric.max_concurrency()
    }
}

impl ReadStat for ResourceNode {
    fn qps(&self, event: MetricEvent) -> f64 {
        self.default_metric.qps(event)
    }

    fn previous_qps(&self, event: MetricEvent) -> f64 {
        self.default_metric.previous_qps(event)
    }

    fn sum(&self, event: MetricEvent) -> i64 {
        self.default_metric.sum(event)
    }

    fn min_rt(&self) -> f64 {
        self.default_metric.min_rt()
    }

    fn avg_rt(&self) -> f64 {
        self.default_metric.avg_rt()
    }
}

impl WriteStat for ResourceNode {
    fn add_count(&self, event: MetricEvent, count: i64) {
        self.global.add_count(event, count);
    }
}

static RESOURCE_NODES: OnceLock<DashMap<String, Arc<ResourceNode>>> = OnceLock::new();

fn resource_nodes() -> &'static DashMap<String, Arc<ResourceNode>> {
    RESOURCE_NODES.get_or_init(DashMap::new)
}

/// Fetch the node for `name`, creating it on first reference.
pub fn get_or_create_resource_node(name: &str, resource_type: ResourceType) -> Arc<ResourceNode> {
    if let Some(node) = resource_nodes().get(name) {
        return node.clone();
    }
    if resource_nodes().len() >= DEFAULT_MAX_RESOURCE_AMOUNT {
        tracing::warn!(amount = resource_nodes().len(), "resource amount exceeds the threshold");
    }
    resource_nodes()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(ResourceNode::new(name.to_string(), resource_type)))
        .clone()
}

pub fn get_resource_node(name: &str) -> Option<Arc<ResourceNode>> {
    resource_nodes().get(name).map(|n| n.clone())
}

pub fn resource_node_list() -> Vec<Arc<ResourceNode>> {
    resource_nodes().iter().map(|e| e.value().clone()).collect()
}

static INBOUND_NODE: OnceLock<Arc<ResourceNode>> = OnceLock::new();

/// The aggregate node accumulating all inbound traffic.
pub fn inbound_node() -> &'static Arc<ResourceNode> {
    INBOUND_NODE.get_or_init(|| {
        Arc::new(ResourceNode::new(TOTAL_INBOUND_RESOURCE_NAME.to_string(), ResourceType::Common))
    })
}
