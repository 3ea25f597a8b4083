//! Semaphore-style concurrency isolation per resource.

pub mod manager;
pub mod rule;
pub mod slot;

pub use manager::{clear_rules, get_rules, load_rules};
pub use rule::{IsolationMetricType, IsolationRule};
