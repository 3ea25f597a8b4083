//! Adaptive system protection: global inbound gating on load, CPU, RT,
//! concurrency and QPS, with a BBR-style admission estimate.

pub mod manager;
pub mod rule;
pub mod slot;

pub use manager::{clear_rules, get_rules, load_rules};
pub use rule::{AdaptiveStrategy, SystemMetricType, SystemRule};
