//! Hot-spot parameter flow control: limits partitioned per argument
//! value, with bounded LRU counter caches.

pub mod cache;
pub mod controller;
pub mod manager;
pub mod rule;
pub mod slot;

pub use controller::ParamFlowController;
pub use manager::{clear_rules, get_rules, load_rules};
pub use rule::{ControlBehavior, HotspotRule, MetricType, SpecificItem};
